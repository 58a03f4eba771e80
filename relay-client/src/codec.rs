//! Conversion between wire tag lists and [`TagMap`].

use relay_types::{
    is_valid_tag_name, Payload, ResultMessage, Tag, TagMap, ACTION_TAG, PAYLOAD_KEY,
};

/// A result message after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Tags, with the raw payload promoted under [`PAYLOAD_KEY`].
    pub tags: TagMap,
    pub data: Option<Payload>,
}

/// Map to wire list in insertion order. The reserved payload key is not a tag
/// and is skipped.
pub fn encode(map: &TagMap) -> Vec<Tag> {
    map.iter()
        .filter(|(name, _)| *name != PAYLOAD_KEY)
        .map(|(name, value)| Tag::new(name, value))
        .collect()
}

/// Fold a wire list into a map; later duplicates win.
pub fn decode(tags: &[Tag]) -> TagMap {
    tags.iter()
        .map(|tag| (tag.name.as_str(), tag.value.as_str()))
        .collect()
}

/// First tag name that is not an ASCII identifier.
pub fn first_invalid_name(map: &TagMap) -> Option<&str> {
    map.iter()
        .map(|(name, _)| name)
        .filter(|name| *name != PAYLOAD_KEY)
        .find(|name| !is_valid_tag_name(name))
}

/// Caller tags with `action` injected as the `Action` tag. The action field
/// wins over a caller-supplied `Action` tag.
pub fn with_action(tags: &TagMap, action: Option<&str>) -> TagMap {
    let mut merged = tags.clone();
    if let Some(action) = action {
        merged.insert(ACTION_TAG, action);
    }
    merged
}

pub fn decode_message(message: &ResultMessage) -> DecodedMessage {
    let mut tags = decode(&message.tags);
    let raw = message.raw_data();
    let data = raw.as_deref().map(Payload::decode);
    if let Some(raw) = raw {
        tags.insert(PAYLOAD_KEY, raw);
    }
    DecodedMessage { tags, data }
}
