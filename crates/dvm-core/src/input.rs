// SPDX-License-Identifier: MIT OR Apache-2.0
//! NIP-90 job-request tag codec.

use std::collections::BTreeMap;

use nostr::Event;
use serde::{Deserialize, Serialize};

use crate::kind_number;

/// A single `i` tag: the input payload handed to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry {
    /// Raw input value.
    pub value: String,
    /// Mime-like input type. Defaults to `"text"` when the tag omits it.
    #[serde(default = "default_input_type")]
    pub input_type: String,
    /// Optional relay hint for event/job inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
}

fn default_input_type() -> String {
    "text".to_string()
}

/// Structured job input decoded from a signed NIP-90 request event.
///
/// The decode is total: malformed tags are skipped, never an error. Tags
/// with fewer than two elements are ignored; a `bid` that does not parse
/// as an integer is dropped silently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    /// Hex event id of the request.
    pub event_id: String,
    /// Hex pubkey of the requester.
    pub customer: String,
    /// Request kind (5000-5999).
    pub kind: u16,
    /// Raw event content, used as the `primary_text` fallback.
    #[serde(default)]
    pub content: String,
    /// `i` tags in arrival order.
    #[serde(default)]
    pub inputs: Vec<InputEntry>,
    /// `param` key/value pairs; the last occurrence of a key wins.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Requested result mime type (`output` tag).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mime: Option<String>,
    /// Customer bid ceiling in millisatoshis (`bid` tag).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_msats: Option<u64>,
    /// Topic tags (`t`), in arrival order.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Whether the request carries the `encrypted` marker.
    #[serde(default)]
    pub encrypted: bool,
}

impl JobInput {
    /// Decode a signed request event into a [`JobInput`].
    pub fn from_event(event: &Event) -> Self {
        let mut input = JobInput {
            event_id: event.id.to_hex(),
            customer: event.pubkey.to_hex(),
            kind: kind_number(event.kind),
            content: event.content.clone(),
            ..Default::default()
        };

        for tag in event.tags.iter() {
            let v = tag.as_vec();
            if v.len() < 2 {
                continue;
            }
            match v[0].as_str() {
                "i" => {
                    input.inputs.push(InputEntry {
                        value: v[1].clone(),
                        input_type: v.get(2).cloned().unwrap_or_else(default_input_type),
                        relay: v.get(3).cloned(),
                    });
                }
                "param" => {
                    if v.len() >= 3 {
                        input.params.insert(v[1].clone(), v[2].clone());
                    }
                }
                "output" => {
                    input.output_mime = Some(v[1].clone());
                }
                "bid" => {
                    if let Ok(msats) = v[1].parse::<u64>() {
                        input.bid_msats = Some(msats);
                    }
                }
                "t" => {
                    input.topics.push(v[1].clone());
                }
                "encrypted" => {
                    input.encrypted = true;
                }
                _ => {}
            }
        }

        input
    }

    /// First `text`-typed input, falling back to the event content, then `""`.
    pub fn primary_text(&self) -> &str {
        for entry in &self.inputs {
            if entry.input_type == "text" {
                return &entry.value;
            }
        }
        &self.content
    }

    /// First input of the given type, if any.
    pub fn input_of_type(&self, input_type: &str) -> Option<&InputEntry> {
        self.inputs.iter().find(|i| i.input_type == input_type)
    }

    /// Whether any topic equals `topic`.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Tag};

    fn request(content: &str, tags: Vec<Vec<&str>>) -> Event {
        let keys = Keys::generate();
        let tags: Vec<Tag> = tags
            .into_iter()
            .map(|t| {
                Tag::parse(t.into_iter().map(String::from).collect::<Vec<_>>())
                    .expect("tag parses")
            })
            .collect();
        EventBuilder::new(Kind::JobRequest(5001), content, tags)
            .to_event(&keys)
            .expect("signable")
    }

    #[test]
    fn decodes_inputs_in_order_with_default_type() {
        let event = request(
            "",
            vec![
                vec!["i", "first"],
                vec!["i", "second", "url", "wss://relay.example"],
            ],
        );
        let input = JobInput::from_event(&event);
        assert_eq!(input.inputs.len(), 2);
        assert_eq!(input.inputs[0].value, "first");
        assert_eq!(input.inputs[0].input_type, "text");
        assert_eq!(input.inputs[1].input_type, "url");
        assert_eq!(input.inputs[1].relay.as_deref(), Some("wss://relay.example"));
    }

    #[test]
    fn duplicate_param_last_wins() {
        let event = request(
            "",
            vec![
                vec!["param", "language", "French"],
                vec!["param", "language", "German"],
            ],
        );
        let input = JobInput::from_event(&event);
        assert_eq!(input.params.get("language").map(String::as_str), Some("German"));
    }

    #[test]
    fn short_tags_are_ignored() {
        let event = request("", vec![vec!["i"], vec!["param", "only-key"]]);
        let input = JobInput::from_event(&event);
        assert!(input.inputs.is_empty());
        assert!(input.params.is_empty());
    }

    #[test]
    fn malformed_bid_is_dropped_silently() {
        let event = request("", vec![vec!["bid", "not-a-number"]]);
        let input = JobInput::from_event(&event);
        assert_eq!(input.bid_msats, None);

        let event = request("", vec![vec!["bid", "2500"]]);
        let input = JobInput::from_event(&event);
        assert_eq!(input.bid_msats, Some(2500));
    }

    #[test]
    fn topics_accumulate_and_encrypted_flag_is_set() {
        let event = request(
            "",
            vec![vec!["t", "summarize"], vec!["t", "news"], vec!["encrypted", "nip44"]],
        );
        let input = JobInput::from_event(&event);
        assert_eq!(input.topics, vec!["summarize", "news"]);
        assert!(input.encrypted);
        assert!(input.has_topic("summarize"));
        assert!(!input.has_topic("sports"));
    }

    #[test]
    fn output_mime_is_captured() {
        let event = request("", vec![vec!["output", "text/plain"]]);
        let input = JobInput::from_event(&event);
        assert_eq!(input.output_mime.as_deref(), Some("text/plain"));
    }

    #[test]
    fn primary_text_prefers_text_inputs_over_content() {
        let event = request(
            "from content",
            vec![vec!["i", "the-url", "url"], vec!["i", "from input", "text"]],
        );
        let input = JobInput::from_event(&event);
        assert_eq!(input.primary_text(), "from input");
    }

    #[test]
    fn primary_text_falls_back_to_content_then_empty() {
        let event = request("fallback", vec![]);
        let input = JobInput::from_event(&event);
        assert_eq!(input.primary_text(), "fallback");

        let event = request("", vec![]);
        let input = JobInput::from_event(&event);
        assert_eq!(input.primary_text(), "");
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let event = request(
            "body",
            vec![
                vec!["i", "hello", "text"],
                vec!["param", "temperature", "0.2"],
                vec!["bid", "9000"],
                vec!["t", "summarize"],
            ],
        );
        let input = JobInput::from_event(&event);
        let json = serde_json::to_string(&input).unwrap();
        let back: JobInput = serde_json::from_str(&json).unwrap();
        assert_eq!(input, back);
    }
}
