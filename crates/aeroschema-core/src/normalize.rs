//! Name, path, and version normalisation for airline message structures.
//!
//! Element names arrive namespace-qualified (`ns2:PaxList`), section paths
//! arrive from both configuration and the streaming scan, and spec versions
//! arrive in several spellings (`18.2`, `2018.2`, `v18.2`). Everything that is
//! compared, grouped, or hashed goes through these functions first so that
//! cosmetic differences never produce distinct patterns.
//!
//! # Node-type synonyms
//!
//! Message schemas rename the same concept between versions (`PaxList` in
//! later releases, `PassengerList` in earlier ones). A [`SynonymTable`] maps
//! every member of a configured group onto one canonical name so that the
//! identification engine treats them as equal.

use std::collections::{BTreeSet, HashMap};

/// Strip a namespace prefix: `"ns2:PaxList"` → `"PaxList"`.
pub fn local_name(name: &str) -> &str {
    let name = name.trim();
    match name.rfind(':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// Split a `/`-separated path into local-name segments.
///
/// Empty segments, namespace prefixes, and positional predicates (`Pax[2]`)
/// are dropped.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .map(|seg| {
            let seg = local_name(seg);
            match seg.find('[') {
                Some(idx) => &seg[..idx],
                None => seg,
            }
        })
        .filter(|seg| !seg.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join path segments with `/`.
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(seg.as_ref());
    }
    out
}

/// Canonical form of a section path.
pub fn normalize_section_path(path: &str) -> String {
    join_path(&split_path(path))
}

/// Canonical comparison key for a node-type name.
///
/// Case, namespace prefix, `_` and `-` are not significant:
/// `"ns:Pax_List"` and `"paxlist"` normalise to the same key.
pub fn normalize_node_type(name: &str) -> String {
    local_name(name)
        .chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Normalise a spec version into `MAJOR.MINOR` with a two-digit major.
///
/// `"18.2"`, `"2018.2"`, `"v18.2"` and `"18.2.0"` all become `"18.2"`.
/// Returns `None` when the input holds no `digits.digits` pair.
pub fn normalize_version(raw: &str) -> Option<String> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);
    let mut parts = raw.split('.');
    let major = parts.next()?.trim();
    let minor = parts.next()?.trim();
    if major.is_empty()
        || minor.is_empty()
        || !major.bytes().all(|b| b.is_ascii_digit())
        || !minor.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let major: u32 = major.parse().ok()?;
    let minor: u32 = minor.parse().ok()?;
    // Four-digit years collapse onto the two-digit release number.
    let major = if major >= 2000 { major - 2000 } else { major };
    Some(format!("{major}.{minor}"))
}

/// Maps node-type names onto a canonical representative per synonym group.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    canonical: HashMap<String, String>,
}

impl SynonymTable {
    /// Build a table from groups of equivalent names.
    ///
    /// The representative of each group is its lexicographically smallest
    /// normalised member, so the result does not depend on group order.
    /// A name listed in several groups joins them.
    pub fn from_groups<I, G, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut merged: Vec<BTreeSet<String>> = Vec::new();
        for group in groups {
            let mut names: BTreeSet<String> = group
                .into_iter()
                .map(|n| normalize_node_type(n.as_ref()))
                .filter(|n| !n.is_empty())
                .collect();
            if names.is_empty() {
                continue;
            }
            // Fold in every existing group sharing a member.
            let mut i = 0;
            while i < merged.len() {
                if merged[i].iter().any(|n| names.contains(n)) {
                    names.extend(merged.swap_remove(i));
                    i = 0;
                } else {
                    i += 1;
                }
            }
            merged.push(names);
        }

        let mut canonical = HashMap::new();
        for names in merged {
            if let Some(rep) = names.iter().next().cloned() {
                for name in names {
                    canonical.insert(name, rep.clone());
                }
            }
        }
        Self { canonical }
    }

    /// Canonical key for a node-type name.
    pub fn canonical(&self, name: &str) -> String {
        let key = normalize_node_type(name);
        match self.canonical.get(&key) {
            Some(rep) => rep.clone(),
            None => key,
        }
    }

    /// Whether two node-type names denote the same concept.
    pub fn equivalent(&self, a: &str, b: &str) -> bool {
        self.canonical(a) == self.canonical(b)
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_name_strips_prefix() {
        assert_eq!(local_name("ns2:PaxList"), "PaxList");
        assert_eq!(local_name("PaxList"), "PaxList");
        assert_eq!(local_name("  a:b:Pax "), "Pax");
    }

    #[test]
    fn split_path_drops_noise() {
        assert_eq!(
            split_path("/ns:Response//DataLists/Pax[2]/"),
            vec!["Response", "DataLists", "Pax"]
        );
        assert!(split_path("").is_empty());
        assert!(split_path("///").is_empty());
    }

    #[test]
    fn section_path_round_trips_clean_input() {
        assert_eq!(
            normalize_section_path("IATA_OrderViewRS/Response/DataLists/PaxList"),
            "IATA_OrderViewRS/Response/DataLists/PaxList"
        );
        assert_eq!(
            normalize_section_path("/a:Root/b:Child/"),
            "Root/Child"
        );
    }

    #[test]
    fn node_type_is_case_and_separator_insensitive() {
        assert_eq!(normalize_node_type("Pax_List"), "paxlist");
        assert_eq!(normalize_node_type("ns:PaxList"), "paxlist");
        assert_eq!(normalize_node_type("pax-list"), "paxlist");
    }

    #[test]
    fn version_spellings_converge() {
        assert_eq!(normalize_version("18.2").as_deref(), Some("18.2"));
        assert_eq!(normalize_version("2018.2").as_deref(), Some("18.2"));
        assert_eq!(normalize_version("v21.3").as_deref(), Some("21.3"));
        assert_eq!(normalize_version("17.2.1").as_deref(), Some("17.2"));
    }

    #[test]
    fn version_rejects_garbage() {
        assert_eq!(normalize_version(""), None);
        assert_eq!(normalize_version("latest"), None);
        assert_eq!(normalize_version("18"), None);
        assert_eq!(normalize_version("18.x"), None);
    }

    #[test]
    fn synonyms_share_representative() {
        let table = SynonymTable::from_groups([vec!["PaxList", "PassengerList"]]);
        assert!(table.equivalent("PaxList", "PassengerList"));
        assert!(table.equivalent("ns:Passenger_List", "paxlist"));
        assert!(!table.equivalent("PaxList", "BaggageAllowanceList"));
        assert_eq!(table.canonical("PaxList"), "passengerlist");
    }

    #[test]
    fn synonym_groups_sharing_a_member_merge() {
        let table = SynonymTable::from_groups([
            vec!["PaxList", "PassengerList"],
            vec!["TravelerList", "PassengerList"],
        ]);
        assert!(table.equivalent("PaxList", "TravelerList"));
    }

    #[test]
    fn unknown_names_fall_back_to_normalised_key() {
        let table = SynonymTable::default();
        assert!(table.is_empty());
        assert_eq!(table.canonical("OrderItem"), "orderitem");
    }
}
