use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// The working data of a flow instance as it moves through steps
///
/// A thin wrapper around a JSON object with dot-path access and the two
/// merge disciplines the engine needs: non-null overwrite for external
/// responses, and overwrite-wins for resuming payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Payload {
    /// The inner JSON value
    pub value: Value,
}

impl Payload {
    /// Create a new payload from a JSON value
    #[inline]
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Create an empty object payload
    #[inline]
    pub fn empty() -> Self {
        Self {
            value: Value::Object(serde_json::Map::new()),
        }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Get a mutable reference to the inner JSON value
    #[inline]
    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Look up a value by dot-separated path (`"debit.account"`)
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = &self.value;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Look up a string field by dot-separated path
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_path(path).and_then(Value::as_str)
    }

    /// Set a value at a dot-separated path, creating intermediate objects
    ///
    /// Silently does nothing if an intermediate segment resolves to a
    /// non-object value; the caller owns the payload shape.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = &mut self.value;

        for segment in &segments[..segments.len() - 1] {
            if !current.is_object() {
                return;
            }
            let map = current.as_object_mut().unwrap();
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }

        if let Some(map) = current.as_object_mut() {
            map.insert(segments[segments.len() - 1].to_string(), value);
        }
    }

    /// Remove the value at a dot-separated path, returning it if present
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = &mut self.value;

        for segment in &segments[..segments.len() - 1] {
            current = current.as_object_mut()?.get_mut(*segment)?;
        }

        current
            .as_object_mut()?
            .remove(segments[segments.len() - 1])
    }

    /// Merge another payload's top-level fields into this one, skipping
    /// null and absent values: a non-null response field overwrites, a
    /// null one never erases existing data
    pub fn merge_non_null(&mut self, other: &Payload) {
        if let (Some(target), Some(source)) = (self.value.as_object_mut(), other.value.as_object())
        {
            for (key, value) in source {
                if !value.is_null() {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Merge another payload's top-level fields into this one; the other
    /// side wins on key collision (used when a resuming payload joins the
    /// working payload)
    pub fn merge_overwrite(&mut self, other: &Payload) {
        if let (Some(target), Some(source)) = (self.value.as_object_mut(), other.value.as_object())
        {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    /// Check if the payload is null
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Try to convert the payload to a specific type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a payload from a serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }
}
