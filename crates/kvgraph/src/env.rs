use std::env;
use std::sync::OnceLock;

static KVGRAPH_SYNC_EACH_NODE: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// When set, dispatch synchronizes after every node so a device failure is
/// reported against the node that caused it.
pub(crate) fn sync_each_node() -> bool {
    *KVGRAPH_SYNC_EACH_NODE.get_or_init(|| match env::var("KVGRAPH_SYNC_EACH_NODE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should parse as true");
        }
        for value in ["0", "false", "off", "nope", ""] {
            assert!(!parse_bool(value), "{value:?} should parse as false");
        }
    }
}
