//! Topic conventions for announcements and per-node data

use crate::{Error, Result};

use super::DecodeError;

/// Default topic nodes announce themselves on
pub const DEFAULT_ANNOUNCE_TOPIC: &str = "client/accepted";

/// Default subscription filter for per-node telemetry
pub const DEFAULT_DATA_FILTER: &str = "Nodes/+/Data";

/// Where node ids live in inbound topics
///
/// The data filter must contain exactly one `+` level; the node id is the
/// text between the literal prefix before it and the literal suffix after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    announce_topic: String,
    data_filter: String,
    data_prefix: String,
    data_suffix: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            announce_topic: DEFAULT_ANNOUNCE_TOPIC.to_string(),
            data_filter: DEFAULT_DATA_FILTER.to_string(),
            data_prefix: "Nodes/".to_string(),
            data_suffix: "/Data".to_string(),
        }
    }
}

impl TopicLayout {
    /// Build a layout from an announce topic and a single-wildcard data filter
    ///
    /// # Errors
    ///
    /// Returns error if the filter does not contain exactly one `+` level, or
    /// uses the multi-level `#` wildcard
    pub fn new(announce_topic: &str, data_filter: &str) -> Result<Self> {
        if announce_topic.is_empty() || announce_topic.contains(['+', '#']) {
            return Err(Error::Config(format!(
                "announce topic must be a plain topic name, got '{announce_topic}'"
            )));
        }

        let levels: Vec<&str> = data_filter.split('/').collect();
        if levels.iter().any(|l| l.contains('#')) {
            return Err(Error::Config(format!(
                "data filter must not use '#': '{data_filter}'"
            )));
        }

        let wildcards: Vec<usize> = levels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == "+")
            .map(|(i, _)| i)
            .collect();
        let [position] = wildcards.as_slice() else {
            return Err(Error::Config(format!(
                "data filter needs exactly one '+' level, got '{data_filter}'"
            )));
        };
        if levels.iter().any(|l| *l != "+" && l.contains('+')) {
            return Err(Error::Config(format!(
                "'+' must occupy a whole level in '{data_filter}'"
            )));
        }

        let before = &levels[..*position];
        let after = &levels[*position + 1..];
        let data_prefix = if before.is_empty() {
            String::new()
        } else {
            format!("{}/", before.join("/"))
        };
        let data_suffix = if after.is_empty() {
            String::new()
        } else {
            format!("/{}", after.join("/"))
        };

        Ok(Self {
            announce_topic: announce_topic.to_string(),
            data_filter: data_filter.to_string(),
            data_prefix,
            data_suffix,
        })
    }

    /// Topic connection announcements arrive on
    #[must_use]
    pub fn announce_topic(&self) -> &str {
        &self.announce_topic
    }

    /// Subscription filter for per-node telemetry
    #[must_use]
    pub fn data_filter(&self) -> &str {
        &self.data_filter
    }

    /// Whether `topic` is the announcement topic
    #[must_use]
    pub fn is_announce(&self, topic: &str) -> bool {
        topic == self.announce_topic
    }

    /// Extract the node id from a telemetry topic
    ///
    /// # Errors
    ///
    /// Returns `TopicMismatch` if either anchor is missing, `EmptyNodeId` for
    /// `Nodes//Data`, and `InvalidNodeId` if the id spans several levels
    pub fn node_id<'a>(&self, topic: &'a str) -> std::result::Result<&'a str, DecodeError> {
        let id = topic
            .strip_prefix(self.data_prefix.as_str())
            .and_then(|rest| rest.strip_suffix(self.data_suffix.as_str()))
            .ok_or_else(|| DecodeError::TopicMismatch(topic.to_string()))?;

        if id.is_empty() {
            return Err(DecodeError::EmptyNodeId);
        }
        if id.contains('/') {
            return Err(DecodeError::InvalidNodeId(id.to_string()));
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_filter() {
        let parsed = TopicLayout::new(DEFAULT_ANNOUNCE_TOPIC, DEFAULT_DATA_FILTER).unwrap();
        assert_eq!(parsed, TopicLayout::default());
    }

    #[test]
    fn extracts_id_between_anchors() {
        let layout = TopicLayout::default();
        assert_eq!(layout.node_id("Nodes/42/Data").unwrap(), "42");
        assert_eq!(layout.node_id("Nodes/abc-01/Data").unwrap(), "abc-01");
    }

    #[test]
    fn rejects_missing_anchor() {
        let layout = TopicLayout::default();
        assert!(matches!(
            layout.node_id("Nodes/42/Status"),
            Err(DecodeError::TopicMismatch(_))
        ));
        assert!(matches!(
            layout.node_id("Devices/42/Data"),
            Err(DecodeError::TopicMismatch(_))
        ));
    }

    #[test]
    fn rejects_empty_and_nested_ids() {
        let layout = TopicLayout::default();
        assert!(matches!(layout.node_id("Nodes//Data"), Err(DecodeError::EmptyNodeId)));
        assert!(matches!(
            layout.node_id("Nodes/a/b/Data"),
            Err(DecodeError::InvalidNodeId(_))
        ));
    }

    #[test]
    fn wildcard_at_edges() {
        let layout = TopicLayout::new("hello", "+/telemetry").unwrap();
        assert_eq!(layout.node_id("n1/telemetry").unwrap(), "n1");

        let layout = TopicLayout::new("hello", "sensors/+").unwrap();
        assert_eq!(layout.node_id("sensors/n2").unwrap(), "n2");
    }

    #[test]
    fn invalid_filters() {
        assert!(TopicLayout::new("hello", "Nodes/Data").is_err());
        assert!(TopicLayout::new("hello", "Nodes/+/+/Data").is_err());
        assert!(TopicLayout::new("hello", "Nodes/#").is_err());
        assert!(TopicLayout::new("hello", "Nodes/x+/Data").is_err());
        assert!(TopicLayout::new("hello/+", "Nodes/+/Data").is_err());
        assert!(TopicLayout::new("", "Nodes/+/Data").is_err());
    }
}
