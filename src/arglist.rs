use serde_json::{Map, Value};

/// Ordered list of `(key, literal)` pairs sent to a backend as the
/// `arguments` object of a command.
///
/// The builder owns the literal convention: strings are JSON-quoted at
/// serialization time, booleans travel raw. Rendering the same list twice
/// yields byte-identical JSON because insertion order is preserved.
#[derive(Debug, Default, Clone)]
pub struct ArgList {
    args: Vec<(String, Value)>,
}

impl ArgList {
    /// Create an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string argument; it will be quoted on the wire.
    pub fn push_string(&mut self, key: &str, value: &str) {
        self.args.push((key.to_owned(), Value::String(value.to_owned())));
    }

    /// Append a boolean argument; it travels as a bare `true`/`false`.
    pub fn push_bool(&mut self, key: &str, value: bool) {
        self.args.push((key.to_owned(), Value::Bool(value)));
    }

    /// True when no argument has been queued.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Drop every queued argument.
    pub fn clear(&mut self) {
        self.args.clear();
    }

    /// Render the list as a JSON object, keys in insertion order.
    pub fn to_object(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.args {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}
