//! JSON codec used by request bodies and response materialization.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Serialize a value to a JSON string.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a JSON string into `T`.
pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// Deserialize a JSON object into a string-keyed map.
///
/// A well-formed document that is not an object is a shape mismatch and
/// fails the same way malformed JSON does.
pub fn to_map(json: &str) -> Result<Map<String, Value>> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Job {
        id: u32,
        name: String,
    }

    #[test]
    fn test_to_json() {
        let json = to_json(&Job { id: 7, name: "sync".into() }).unwrap();
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"name\":\"sync\""));
    }

    #[test]
    fn test_from_json_shape_mismatch() {
        let err = from_json::<Job>(r#"{"id":"seven"}"#).unwrap_err();
        assert!(matches!(err, HttpError::Json(_)));
    }

    #[test]
    fn test_to_map() {
        let map = to_map(r#"{"a":1,"b":{"c":true}}"#).unwrap();
        assert_eq!(map["a"], 1);
        assert_eq!(map["b"]["c"], true);
    }

    #[test]
    fn test_to_map_rejects_non_object() {
        assert!(matches!(to_map("[1,2]"), Err(HttpError::Json(_))));
        assert!(matches!(to_map("{oops"), Err(HttpError::Json(_))));
    }
}
