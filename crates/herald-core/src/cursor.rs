//! Cursor over a request's device sets.
//!
//! A [`RequestCursor`] walks the multiplexed devices first, then the
//! batched map, yielding each `(token, payload)` pair exactly once per
//! traversal. The request itself stays immutable; all iteration state
//! lives here. Batched keys are snapshotted once, so the (arbitrary) map
//! order is stable across `reset()` for the lifetime of one cursor.

use crate::model::{Message, Request};

/// Stateful cursor yielding one [`Message`] per device in a [`Request`].
///
/// Tokens appearing in both the multiplexed list and the batched map are
/// yielded twice; the cursor does not deduplicate.
#[derive(Debug)]
pub struct RequestCursor<'a> {
    request: &'a Request,
    batched_keys: Vec<&'a str>,
    multi_len: usize,
    total: usize,
    cursor: isize,
    initialized: bool,
}

impl<'a> RequestCursor<'a> {
    /// Creates a cursor positioned before the first device.
    pub fn new(request: &'a Request) -> Self {
        Self {
            request,
            batched_keys: Vec::new(),
            multi_len: 0,
            total: 0,
            cursor: -1,
            initialized: false,
        }
    }

    /// Snapshots the device sets on first use. Idempotent.
    fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        if let Some(batched) = &self.request.batched {
            self.batched_keys = batched.keys().map(String::as_str).collect();
        }
        if let Some(multiplexed) = &self.request.multiplexed {
            self.multi_len = multiplexed.devices.len();
        }
        self.total = self.multi_len + self.batched_keys.len();
    }

    /// Total number of devices across both sets.
    pub fn count(&mut self) -> usize {
        self.initialize();
        self.total
    }

    /// Advances to the next device. Returns `false` once exhausted.
    ///
    /// The first call positions the cursor on index 0.
    pub fn next(&mut self) -> bool {
        self.initialize();
        self.cursor += 1;
        (self.cursor as usize) < self.total
    }

    /// The device/payload pair at the current position.
    ///
    /// Returns `None` before the first `next()` and after exhaustion.
    pub fn value(&self) -> Option<Message> {
        if self.cursor < 0 {
            return None;
        }
        let index = self.cursor as usize;
        if index >= self.total {
            return None;
        }
        if index < self.multi_len {
            let multiplexed = self.request.multiplexed.as_ref()?;
            return Some(Message {
                token: multiplexed.devices[index].clone(),
                payload: multiplexed.payload.clone(),
            });
        }
        let key = self.batched_keys[index - self.multi_len];
        let payload = self.request.batched.as_ref()?.get(key)?;
        Some(Message { token: key.to_string(), payload: payload.clone() })
    }

    /// Rewinds to the pre-start position, keeping the key snapshot.
    pub fn reset(&mut self) {
        self.cursor = -1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use proptest::prelude::*;
    use serde_json::value::RawValue;

    use super::*;
    use crate::model::{Batched, Multiplexed};

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).expect("valid JSON")
    }

    fn request(multiplexed: &[&str], batched: &[&str]) -> Request {
        let multiplexed = if multiplexed.is_empty() {
            None
        } else {
            Some(Multiplexed {
                devices: multiplexed.iter().map(ToString::to_string).collect(),
                payload: raw(r#"{"shared":true}"#),
            })
        };
        let batched = if batched.is_empty() {
            None
        } else {
            Some(
                batched
                    .iter()
                    .map(|token| (token.to_string(), raw(&format!(r#"{{"for":"{token}"}}"#))))
                    .collect::<Batched>(),
            )
        };
        Request { multiplexed, batched, ..Request::default() }
    }

    fn drain(cursor: &mut RequestCursor<'_>) -> Vec<Message> {
        let mut messages = Vec::new();
        while cursor.next() {
            messages.push(cursor.value().expect("value within bounds"));
        }
        messages
    }

    #[test]
    fn yields_multiplexed_then_batched_exactly_once() {
        let request = request(&["m1", "m2"], &["b1", "b2", "b3"]);
        let mut cursor = RequestCursor::new(&request);

        assert_eq!(cursor.count(), 5);
        let messages = drain(&mut cursor);
        assert_eq!(messages.len(), 5);

        assert_eq!(messages[0].token, "m1");
        assert_eq!(messages[1].token, "m2");
        assert_eq!(messages[0].payload.get(), r#"{"shared":true}"#);

        let batched_tokens: HashSet<_> =
            messages[2..].iter().map(|m| m.token.clone()).collect();
        assert_eq!(
            batched_tokens,
            HashSet::from(["b1".to_string(), "b2".to_string(), "b3".to_string()])
        );
        for message in &messages[2..] {
            assert_eq!(message.payload.get(), format!(r#"{{"for":"{}"}}"#, message.token));
        }

        assert!(!cursor.next(), "exhausted cursor must keep returning false");
        assert!(cursor.value().is_none());
    }

    #[test]
    fn count_is_idempotent_and_does_not_advance() {
        let request = request(&["m1"], &["b1"]);
        let mut cursor = RequestCursor::new(&request);
        assert_eq!(cursor.count(), 2);
        assert_eq!(cursor.count(), 2);

        let messages = drain(&mut cursor);
        assert_eq!(messages.len(), 2, "count() must not consume positions");
    }

    #[test]
    fn value_before_first_next_is_none() {
        let request = request(&["m1"], &[]);
        let cursor = RequestCursor::new(&request);
        assert!(cursor.value().is_none());
    }

    #[test]
    fn reset_replays_the_same_sequence() {
        let request = request(&["m1"], &["b1", "b2"]);
        let mut cursor = RequestCursor::new(&request);

        let first: Vec<String> = drain(&mut cursor).into_iter().map(|m| m.token).collect();
        cursor.reset();
        let second: Vec<String> = drain(&mut cursor).into_iter().map(|m| m.token).collect();

        assert_eq!(first, second, "batched order must be stable across reset");
    }

    #[test]
    fn empty_request_counts_zero() {
        let request = request(&[], &[]);
        let mut cursor = RequestCursor::new(&request);
        assert_eq!(cursor.count(), 0);
        assert!(!cursor.next());
        assert!(cursor.value().is_none());
    }

    #[test]
    fn duplicate_token_across_sets_is_yielded_twice() {
        let request = request(&["dup"], &["dup"]);
        let mut cursor = RequestCursor::new(&request);
        let messages = drain(&mut cursor);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].token, "dup");
        assert_eq!(messages[1].token, "dup");
    }

    proptest! {
        #[test]
        fn traversal_covers_every_device_exactly_once(
            multiplexed in proptest::collection::vec("[a-z]{1,8}", 0..20),
            batched in proptest::collection::hash_set("[A-Z]{1,8}", 0..20),
        ) {
            let multiplexed_refs: Vec<&str> = multiplexed.iter().map(String::as_str).collect();
            let batched_refs: Vec<&str> = batched.iter().map(String::as_str).collect();
            let request = request(&multiplexed_refs, &batched_refs);
            let mut cursor = RequestCursor::new(&request);

            let expected = multiplexed.len() + batched.len();
            prop_assert_eq!(cursor.count(), expected);

            let messages = drain(&mut cursor);
            prop_assert_eq!(messages.len(), expected);

            // Multiplexed tokens come first, in order; batched tokens cover the map.
            let (multi_part, batched_part) = messages.split_at(multiplexed.len());
            let multi_tokens: Vec<String> =
                multi_part.iter().map(|m| m.token.clone()).collect();
            prop_assert_eq!(multi_tokens, multiplexed);

            let mut seen: HashMap<String, usize> = HashMap::new();
            for message in batched_part {
                *seen.entry(message.token.clone()).or_default() += 1;
            }
            for token in &batched {
                prop_assert_eq!(seen.get(token), Some(&1));
            }
        }
    }
}
