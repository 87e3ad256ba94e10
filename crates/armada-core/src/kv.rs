//! `key=value,...` option bags.
//!
//! Used for discovery options and engine descriptors. Each comma-separated
//! item is split on its first `=`; an item without `=` maps to an empty value.

use std::collections::HashMap;

/// Parse a comma-separated `key=value` list.
pub fn parse_kv_string(input: &str) -> HashMap<String, String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (item.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_on_first_equals() {
        let parsed = parse_kv_string("HELLO=WORLD,a=b=c=d,e");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["HELLO"], "WORLD");
        assert_eq!(parsed["a"], "b=c=d");
        assert_eq!(parsed["e"], "");
    }

    #[test]
    fn empty_input_is_empty_map() {
        assert!(parse_kv_string("").is_empty());
        assert!(parse_kv_string(",,").is_empty());
    }

    proptest! {
        #[test]
        fn value_keeps_everything_after_first_equals(
            key in "[a-zA-Z][a-zA-Z0-9._]{0,8}",
            value in "[a-zA-Z0-9=/.]{0,16}",
        ) {
            let parsed = parse_kv_string(&format!("{key}={value}"));
            prop_assert_eq!(parsed.get(&key), Some(&value));
        }
    }
}
