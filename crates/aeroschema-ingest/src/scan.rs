//! Single-pass streaming extraction of target subtrees.
//!
//! The scan keeps only a stack of open elements (local name plus trie node)
//! and, while inside a target, the partially built target subtree. Each
//! parse event is decoded into owned data and its read buffer cleared before
//! the next event, so memory stays proportional to nesting depth plus the
//! largest target subtree, never to document size.
//!
//! Overlapping targets: once inside a target, nested targets are part of the
//! outer subtree and are not yielded again, unless configured `independent`,
//! in which case they are yielded on their own as well (before the outer
//! subtree, since they close first).

use std::collections::{HashMap, VecDeque};
use std::io::BufRead;

use aeroschema_core::Limits;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};

use crate::IngestError;
use crate::header::DocumentHeader;
use crate::subtree::{Subtree, XmlElement};
use crate::trie::{PathTrie, TargetInfo};

/// A parse event reduced to owned data.
enum Step {
    Start {
        name: String,
        attributes: Vec<(String, String)>,
        empty: bool,
    },
    End,
    Text(String),
    Eof,
    Skip,
}

/// Pull-parser over one XML document.
///
/// Call [`read_header`](Self::read_header) to learn the message root and
/// version, then [`into_subtrees`](Self::into_subtrees) with the trie built
/// for that profile to continue the same pass.
pub struct XmlScanner<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    root: Option<Step>,
}

impl<R: BufRead> XmlScanner<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            root: None,
        }
    }

    /// Read up to and including the root element start tag.
    pub fn read_header(&mut self) -> Result<DocumentHeader, IngestError> {
        loop {
            match self.next_step()? {
                Step::Start {
                    name,
                    attributes,
                    empty,
                } => {
                    let header = DocumentHeader::detect(&name, &attributes);
                    debug!(
                        root = %header.message_root,
                        version = ?header.declared_version,
                        "read document header"
                    );
                    self.root = Some(Step::Start {
                        name: header.message_root.clone(),
                        attributes: strip_namespace_declarations(attributes),
                        empty,
                    });
                    return Ok(header);
                }
                Step::Text(_) => {
                    return Err(IngestError::parse(
                        self.position(),
                        "character data before root element",
                    ));
                }
                Step::End => {
                    return Err(IngestError::parse(
                        self.position(),
                        "end tag before root element",
                    ));
                }
                Step::Eof => return Err(IngestError::EmptyDocument),
                Step::Skip => {}
            }
        }
    }

    /// Continue the pass, yielding every target subtree in document order of
    /// their closing tags.
    pub fn into_subtrees(mut self, trie: PathTrie, limits: Limits) -> SubtreeStream<R> {
        let root = self.root.take();
        SubtreeStream {
            scanner: self,
            trie,
            max_bytes: limits.max_subtree_bytes,
            frames: Vec::new(),
            open: Vec::new(),
            capture_bytes: 0,
            truncated: false,
            ready: VecDeque::new(),
            ordinals: HashMap::new(),
            pending_root: root,
            root_closed: false,
            finished: false,
        }
    }

    fn position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    /// Decode the next event and release its buffer.
    fn next_step(&mut self) -> Result<Step, IngestError> {
        let mut buf = std::mem::take(&mut self.buf);
        let step = match self.reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => decode_start(&e, false),
            Ok(Event::Empty(e)) => decode_start(&e, true),
            Ok(Event::End(_)) => Ok(Step::End),
            Ok(Event::Text(t)) => t
                .unescape()
                .map(|s| Step::Text(s.into_owned()))
                .map_err(|err| err.to_string()),
            Ok(Event::CData(c)) => std::str::from_utf8(&c)
                .map(|s| Step::Text(s.to_string()))
                .map_err(|err| err.to_string()),
            Ok(Event::Eof) => Ok(Step::Eof),
            Ok(_) => Ok(Step::Skip),
            Err(err) => Err(err.to_string()),
        };
        buf.clear();
        self.buf = buf;
        step.map_err(|message| IngestError::parse(self.position(), message))
    }
}

fn decode_start(e: &BytesStart<'_>, empty: bool) -> Result<Step, String> {
    let name = std::str::from_utf8(e.local_name().as_ref())
        .map_err(|err| err.to_string())?
        .to_string();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| err.to_string())?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| err.to_string())?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Step::Start {
        name,
        attributes,
        empty,
    })
}

fn is_namespace_declaration(key: &str) -> bool {
    key == "xmlns" || key.starts_with("xmlns:")
}

/// Drop `xmlns` declarations and reduce keys to local names.
fn strip_namespace_declarations(attributes: Vec<(String, String)>) -> Vec<(String, String)> {
    attributes
        .into_iter()
        .filter(|(k, _)| !is_namespace_declaration(k))
        .map(|(k, v)| {
            let local = aeroschema_core::normalize::local_name(&k).to_string();
            (local, v)
        })
        .collect()
}

fn element_cost(name: &str, attributes: &[(String, String)]) -> usize {
    name.len()
        + attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
}

struct Frame {
    name: String,
    trie_node: Option<usize>,
    /// This element has an entry in `open`.
    captured: bool,
}

struct OpenElement {
    element: XmlElement,
    /// Set when this element starts a subtree to be yielded.
    target: Option<(TargetInfo, u32)>,
}

/// Iterator over target subtrees of one document.
///
/// A parse error is yielded once and ends the iteration; no subtree is
/// produced from content after the error.
pub struct SubtreeStream<R: BufRead> {
    scanner: XmlScanner<R>,
    trie: PathTrie,
    max_bytes: usize,
    frames: Vec<Frame>,
    open: Vec<OpenElement>,
    capture_bytes: usize,
    truncated: bool,
    ready: VecDeque<Subtree>,
    ordinals: HashMap<String, u32>,
    pending_root: Option<Step>,
    root_closed: bool,
    finished: bool,
}

impl<R: BufRead> SubtreeStream<R> {
    fn advance(&mut self) -> Result<(), IngestError> {
        let step = match self.pending_root.take() {
            Some(root) => root,
            None => self.scanner.next_step()?,
        };
        match step {
            Step::Start {
                name,
                attributes,
                empty,
            } => {
                let attributes = strip_namespace_declarations(attributes);
                self.on_start(name, attributes)?;
                if empty {
                    self.on_end()?;
                }
            }
            Step::End => self.on_end()?,
            Step::Text(text) => self.on_text(&text),
            Step::Eof => {
                if let Some(frame) = self.frames.last() {
                    return Err(IngestError::UnexpectedEof {
                        open: frame.name.clone(),
                    });
                }
                if !self.root_closed {
                    return Err(IngestError::EmptyDocument);
                }
                self.finished = true;
            }
            Step::Skip => {}
        }
        Ok(())
    }

    fn on_start(
        &mut self,
        name: String,
        attributes: Vec<(String, String)>,
    ) -> Result<(), IngestError> {
        if self.root_closed {
            return Err(IngestError::parse(
                self.scanner.position(),
                format!("element <{name}> after the root element closed"),
            ));
        }

        let trie_node = match self.frames.last() {
            None => self.trie.step_root(&name),
            Some(parent) => parent
                .trie_node
                .and_then(|node| self.trie.step(node, &name)),
        };
        let target = trie_node.and_then(|node| self.trie.target(node)).cloned();
        let cost = element_cost(&name, &attributes);

        let captured = if self.open.is_empty() {
            match target {
                Some(info) => {
                    let ordinal = self.next_ordinal(&info.section_path);
                    self.capture_bytes = cost;
                    self.truncated = cost > self.max_bytes;
                    let element = XmlElement {
                        name: name.clone(),
                        attributes,
                        ..XmlElement::default()
                    };
                    self.open.push(OpenElement {
                        element,
                        target: Some((info, ordinal)),
                    });
                    true
                }
                None => false,
            }
        } else if self.frames.last().is_some_and(|f| f.captured) && !self.truncated {
            if self.capture_bytes + cost > self.max_bytes {
                self.truncated = true;
                false
            } else {
                self.capture_bytes += cost;
                let target = match target {
                    Some(info) if info.independent => {
                        let ordinal = self.next_ordinal(&info.section_path);
                        Some((info, ordinal))
                    }
                    _ => None,
                };
                let element = XmlElement {
                    name: name.clone(),
                    attributes,
                    ..XmlElement::default()
                };
                self.open.push(OpenElement { element, target });
                true
            }
        } else {
            false
        };

        self.frames.push(Frame {
            name,
            trie_node,
            captured,
        });
        Ok(())
    }

    fn on_end(&mut self) -> Result<(), IngestError> {
        let Some(frame) = self.frames.pop() else {
            return Err(IngestError::parse(
                self.scanner.position(),
                "unbalanced end tag",
            ));
        };
        if self.frames.is_empty() {
            self.root_closed = true;
        }
        if !frame.captured {
            return Ok(());
        }
        let Some(OpenElement { element, target }) = self.open.pop() else {
            return Ok(());
        };
        if self.open.is_empty() {
            if let Some((info, ordinal)) = target {
                let subtree = self.make_subtree(info, ordinal, element);
                self.ready.push_back(subtree);
            }
            self.capture_bytes = 0;
            self.truncated = false;
            return Ok(());
        }
        let subtree = target.map(|(info, ordinal)| self.make_subtree(info, ordinal, element.clone()));
        if let Some(parent) = self.open.last_mut() {
            parent.element.children.push(element);
        }
        if let Some(subtree) = subtree {
            self.ready.push_back(subtree);
        }
        Ok(())
    }

    fn on_text(&mut self, text: &str) {
        if text.is_empty() || self.truncated {
            return;
        }
        if !self.frames.last().is_some_and(|f| f.captured) {
            return;
        }
        if self.capture_bytes + text.len() > self.max_bytes {
            self.truncated = true;
            return;
        }
        if let Some(top) = self.open.last_mut() {
            self.capture_bytes += text.len();
            top.element.append_text(text);
        }
    }

    fn next_ordinal(&mut self, section_path: &str) -> u32 {
        let counter = self.ordinals.entry(section_path.to_string()).or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        ordinal
    }

    fn make_subtree(&self, info: TargetInfo, ordinal: u32, root: XmlElement) -> Subtree {
        if self.truncated {
            warn!(
                section_path = %info.section_path,
                ordinal,
                limit = self.max_bytes,
                "target subtree exceeded size ceiling, truncated"
            );
        }
        Subtree {
            section_path: info.section_path,
            node_type: info.node_type,
            ordinal,
            root,
            truncated: self.truncated,
            size_bytes: self.capture_bytes,
        }
    }
}

impl<R: BufRead> Iterator for SubtreeStream<R> {
    type Item = Result<Subtree, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(subtree) = self.ready.pop_front() {
                return Some(Ok(subtree));
            }
            if self.finished {
                return None;
            }
            if let Err(err) = self.advance() {
                self.finished = true;
                self.ready.clear();
                return Some(Err(err));
            }
        }
    }
}
