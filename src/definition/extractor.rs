use std::collections::{BTreeMap, BTreeSet};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Elements that can carry an external-task topic.
const TOPIC_ELEMENTS: &[&[u8]] = &[
    b"serviceTask",
    b"sendTask",
    b"businessRuleTask",
    b"scriptTask",
    b"messageEventDefinition",
];

/// Routing metadata declared on a task element through `camunda:property`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHint {
    pub service_type: Option<String>,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
}

impl RoutingHint {
    pub fn is_empty(&self) -> bool {
        self.service_type.is_none() && self.service_name.is_none() && self.service_version.is_none()
    }

    fn set(&mut self, name: &str, value: String) {
        match name {
            "serviceType" => self.service_type = Some(value),
            "serviceName" => self.service_name = Some(value),
            "serviceVersion" => self.service_version = Some(value),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessTopics {
    pub topics: BTreeSet<String>,
    pub hints: BTreeMap<String, RoutingHint>,
}

#[derive(Debug, Error)]
enum ExtractError {
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error("{0} element(s) left unclosed at end of document")]
    Unclosed(usize),
    #[error("document has no root element")]
    NoRoot,
}

/// Open topic-bearing element, waiting for its end tag.
struct Frame {
    topic: String,
    depth: usize,
    hint: RoutingHint,
}

pub fn extract_topics(xml: &str) -> BTreeSet<String> {
    extract(xml).topics
}

/// Extracts topics and routing hints. Malformed input yields an empty result.
pub fn extract(xml: &str) -> ProcessTopics {
    match parse(xml) {
        Ok(found) => {
            debug!(topics = found.topics.len(), "Extracted topics from process definition");
            found
        }
        Err(e) => {
            warn!(error = %e, "Malformed process definition, no topics extracted");
            ProcessTopics::default()
        }
    }
}

fn parse(xml: &str) -> Result<ProcessTopics, ExtractError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut found = ProcessTopics::default();
    let mut frames: Vec<Frame> = Vec::new();
    let mut depth = 0usize;
    let mut seen_element = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                seen_element = true;
                if let Some(topic) = topic_of(&e)? {
                    found.topics.insert(topic.clone());
                    frames.push(Frame { topic, depth, hint: RoutingHint::default() });
                } else if e.local_name().as_ref() == b"property" {
                    apply_property(&e, frames.last_mut())?;
                }
                depth += 1;
            }
            Event::Empty(e) => {
                seen_element = true;
                if let Some(topic) = topic_of(&e)? {
                    found.topics.insert(topic);
                } else if e.local_name().as_ref() == b"property" {
                    apply_property(&e, frames.last_mut())?;
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if frames.last().is_some_and(|f| f.depth == depth) {
                    if let Some(frame) = frames.pop() {
                        if !frame.hint.is_empty() {
                            found.hints.entry(frame.topic).or_insert(frame.hint);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(ExtractError::Unclosed(depth));
    }
    if !seen_element && !xml.trim().is_empty() {
        return Err(ExtractError::NoRoot);
    }
    Ok(found)
}

fn topic_of(e: &BytesStart<'_>) -> Result<Option<String>, quick_xml::Error> {
    let name = e.local_name();
    if !TOPIC_ELEMENTS.contains(&name.as_ref()) {
        return Ok(None);
    }
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == b"topic" {
            let value = attr.unescape_value()?.trim().to_string();
            if !value.is_empty() {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

fn apply_property(e: &BytesStart<'_>, frame: Option<&mut Frame>) -> Result<(), quick_xml::Error> {
    let Some(frame) = frame else {
        return Ok(());
    };
    let mut name = None;
    let mut value = None;
    for attr in e.attributes() {
        let attr = attr?;
        match attr.key.local_name().as_ref() {
            b"name" => name = Some(attr.unescape_value()?.into_owned()),
            b"value" => value = Some(attr.unescape_value()?.trim().to_string()),
            _ => {}
        }
    }
    if let (Some(name), Some(value)) = (name, value) {
        frame.hint.set(&name, value);
    }
    Ok(())
}
