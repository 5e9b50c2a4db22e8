use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A file reference carried through the pool. Bytes live in external storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    #[serde(default)]
    pub id: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_transfer_method")]
    pub transfer_method: String,
}

fn default_transfer_method() -> String {
    "remote_url".to_string()
}

impl File {
    pub fn remote(filename: impl Into<String>, url: impl Into<String>) -> Self {
        let filename = filename.into();
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{}", ext.to_lowercase()));
        Self {
            id: None,
            filename,
            extension,
            mime_type: None,
            size: 0,
            url: Some(url.into()),
            transfer_method: default_transfer_method(),
        }
    }

    pub fn is_image(&self) -> bool {
        if let Some(mime) = &self.mime_type {
            return mime.starts_with("image/");
        }
        matches!(
            self.extension.as_deref(),
            Some(".png" | ".jpg" | ".jpeg" | ".gif" | ".webp" | ".svg")
        )
    }

    /// Markdown rendering used when a file is interpolated into text.
    pub fn markdown(&self) -> String {
        let url = self.url.as_deref().unwrap_or_default();
        if self.is_image() {
            format!("![{}]({})", self.filename, url)
        } else {
            format!("[{}]({})", self.filename, url)
        }
    }

    /// Attribute lookup for selectors such as `node.file.size`.
    pub fn attribute(&self, name: &str) -> Option<Segment> {
        match name {
            "name" | "filename" => Some(Segment::String(self.filename.clone())),
            "size" => Some(Segment::Integer(self.size)),
            "extension" => self.extension.clone().map(Segment::String),
            "mime_type" | "type" => self.mime_type.clone().map(Segment::String),
            "url" => self.url.clone().map(Segment::String),
            "transfer_method" => Some(Segment::String(self.transfer_method.clone())),
            "id" | "related_id" => self.id.clone().map(Segment::String),
            _ => None,
        }
    }
}

/// Declared type of a segment, used by node configs and output validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentType {
    None,
    String,
    Number,
    Integer,
    Float,
    Boolean,
    Object,
    #[serde(rename = "array[string]")]
    ArrayString,
    #[serde(rename = "array[number]")]
    ArrayNumber,
    #[serde(rename = "array[boolean]")]
    ArrayBoolean,
    #[serde(rename = "array[object]")]
    ArrayObject,
    #[serde(rename = "array[any]")]
    ArrayAny,
    File,
    #[serde(rename = "array[file]")]
    ArrayFile,
    Any,
}

impl SegmentType {
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Self::ArrayString
                | Self::ArrayNumber
                | Self::ArrayBoolean
                | Self::ArrayObject
                | Self::ArrayAny
                | Self::ArrayFile
        )
    }

    /// Whether a value of type `actual` may be stored where `self` is declared.
    pub fn accepts(&self, actual: SegmentType) -> bool {
        match (self, actual) {
            (Self::Any, _) => true,
            (a, b) if *a == b => true,
            (Self::Number, Self::Integer | Self::Float) => true,
            (Self::Float, Self::Integer) => true,
            (Self::ArrayAny, b) => b.is_array(),
            (_, Self::None) => true,
            // empty arrays come through as array[any]
            (a, Self::ArrayAny) => a.is_array(),
            _ => false,
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::ArrayString => "array[string]",
            Self::ArrayNumber => "array[number]",
            Self::ArrayBoolean => "array[boolean]",
            Self::ArrayObject => "array[object]",
            Self::ArrayAny => "array[any]",
            Self::File => "file",
            Self::ArrayFile => "array[file]",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// A typed value stored in the variable pool.
///
/// Integers and floats stay distinct so a node producing `3` never reads
/// back `3.0`. Arrays keep element order and duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "value", rename_all = "kebab-case")]
pub enum Segment {
    None,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Object(Map<String, Value>),
    ArrayString(Vec<String>),
    ArrayNumber(Vec<Number>),
    ArrayBoolean(Vec<bool>),
    ArrayObject(Vec<Map<String, Value>>),
    ArrayAny(Vec<Value>),
    File(File),
    ArrayFile(Vec<File>),
}

impl Segment {
    pub fn segment_type(&self) -> SegmentType {
        match self {
            Self::None => SegmentType::None,
            Self::String(_) => SegmentType::String,
            Self::Integer(_) => SegmentType::Integer,
            Self::Float(_) => SegmentType::Float,
            Self::Boolean(_) => SegmentType::Boolean,
            Self::Object(_) => SegmentType::Object,
            Self::ArrayString(_) => SegmentType::ArrayString,
            Self::ArrayNumber(_) => SegmentType::ArrayNumber,
            Self::ArrayBoolean(_) => SegmentType::ArrayBoolean,
            Self::ArrayObject(_) => SegmentType::ArrayObject,
            Self::ArrayAny(_) => SegmentType::ArrayAny,
            Self::File(_) => SegmentType::File,
            Self::ArrayFile(_) => SegmentType::ArrayFile,
        }
    }

    /// Infer a segment from an untyped JSON value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::String(s) => Self::String(s),
            Value::Bool(b) => Self::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::Object(map) => Self::Object(map),
            Value::Array(items) => Self::array_from_values(items),
        }
    }

    fn array_from_values(items: Vec<Value>) -> Self {
        if items.is_empty() {
            return Self::ArrayAny(items);
        }
        if items.iter().all(Value::is_string) {
            return Self::ArrayString(
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            );
        }
        if items.iter().all(Value::is_number) {
            return Self::ArrayNumber(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Number(n) => Some(n),
                        _ => None,
                    })
                    .collect(),
            );
        }
        if items.iter().all(Value::is_boolean) {
            return Self::ArrayBoolean(items.iter().filter_map(Value::as_bool).collect());
        }
        if items.iter().all(Value::is_object) {
            return Self::ArrayObject(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Object(m) => Some(m),
                        _ => None,
                    })
                    .collect(),
            );
        }
        Self::ArrayAny(items)
    }

    /// Build a segment of a declared type, coercing where it is lossless.
    pub fn from_value_typed(value: Value, declared: SegmentType) -> Option<Self> {
        match declared {
            SegmentType::File => serde_json::from_value(value).ok().map(Self::File),
            SegmentType::ArrayFile => serde_json::from_value(value).ok().map(Self::ArrayFile),
            SegmentType::Float => value.as_f64().map(Self::Float),
            SegmentType::Integer => value.as_i64().map(Self::Integer),
            other => {
                let seg = Self::from_value(value);
                other.accepts(seg.segment_type()).then_some(seg)
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Object(m) => Value::Object(m.clone()),
            Self::ArrayString(v) => Value::from(v.clone()),
            Self::ArrayNumber(v) => Value::Array(v.iter().cloned().map(Value::Number).collect()),
            Self::ArrayBoolean(v) => Value::from(v.clone()),
            Self::ArrayObject(v) => Value::Array(v.iter().cloned().map(Value::Object).collect()),
            Self::ArrayAny(v) => Value::Array(v.clone()),
            Self::File(f) => serde_json::to_value(f).unwrap_or(Value::Null),
            Self::ArrayFile(v) => serde_json::to_value(v).unwrap_or(Value::Null),
        }
    }

    /// Text rendering used by template interpolation.
    pub fn text(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => float_text(*f),
            Self::Boolean(b) => b.to_string(),
            Self::File(f) => f.markdown(),
            Self::ArrayFile(files) => files
                .iter()
                .map(File::markdown)
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_value().to_string(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Empty string, empty array, empty object or none.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::String(s) => s.is_empty(),
            Self::Object(m) => m.is_empty(),
            Self::ArrayString(v) => v.is_empty(),
            Self::ArrayNumber(v) => v.is_empty(),
            Self::ArrayBoolean(v) => v.is_empty(),
            Self::ArrayObject(v) => v.is_empty(),
            Self::ArrayAny(v) => v.is_empty(),
            Self::ArrayFile(v) => v.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Elements of an array segment, each as its own segment.
    pub fn items(&self) -> Option<Vec<Segment>> {
        let items = match self {
            Self::ArrayString(v) => v.iter().cloned().map(Segment::String).collect(),
            Self::ArrayNumber(v) => v
                .iter()
                .cloned()
                .map(|n| Segment::from_value(Value::Number(n)))
                .collect(),
            Self::ArrayBoolean(v) => v.iter().copied().map(Segment::Boolean).collect(),
            Self::ArrayObject(v) => v.iter().cloned().map(Segment::Object).collect(),
            Self::ArrayAny(v) => v.iter().cloned().map(Segment::from_value).collect(),
            Self::ArrayFile(v) => v.iter().cloned().map(Segment::File).collect(),
            _ => return None,
        };
        Some(items)
    }

    /// Build an array segment from per-item segments, keeping the most specific type.
    pub fn from_items(items: Vec<Segment>) -> Self {
        if !items.is_empty() && items.iter().all(|s| matches!(s, Segment::File(_))) {
            return Self::ArrayFile(
                items
                    .into_iter()
                    .filter_map(|s| match s {
                        Segment::File(f) => Some(f),
                        _ => None,
                    })
                    .collect(),
            );
        }
        Self::array_from_values(items.iter().map(Segment::to_value).collect())
    }

    /// Descend into an object or file attribute by path.
    pub fn get_path(&self, path: &[String]) -> Option<Segment> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self.clone());
        };
        match self {
            Self::Object(map) => {
                let mut current = map.get(head)?;
                for key in rest {
                    current = current.as_object()?.get(key)?;
                }
                Some(Segment::from_value(current.clone()))
            }
            Self::File(file) if rest.is_empty() => file.attribute(head),
            _ => None,
        }
    }
}

/// Whole floats keep their fraction so `2.0` never reads as the integer `2`.
fn float_text(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Segment {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Segment {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Segment {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Value> for Segment {
    fn from(v: Value) -> Self {
        Self::from_value(v)
    }
}

impl From<File> for Segment {
    fn from(f: File) -> Self {
        Self::File(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_kind_preserved() {
        assert_eq!(Segment::from_value(json!(3)), Segment::Integer(3));
        assert_eq!(Segment::from_value(json!(3.5)), Segment::Float(3.5));
        assert_eq!(Segment::from_value(json!(3)).text(), "3");
    }

    #[test]
    fn test_float_text_keeps_fraction() {
        assert_eq!(Segment::Float(2.0).text(), "2.0");
        assert_eq!(Segment::Integer(2).text(), "2");
        assert_eq!(Segment::Float(2.5).text(), "2.5");
        assert_eq!(Segment::Float(-3.0).text(), "-3.0");
    }

    #[test]
    fn test_array_inference_keeps_order_and_duplicates() {
        let seg = Segment::from_value(json!(["b", "a", "b"]));
        assert_eq!(
            seg,
            Segment::ArrayString(vec!["b".into(), "a".into(), "b".into()])
        );
        let mixed = Segment::from_value(json!([1, "x"]));
        assert_eq!(mixed.segment_type(), SegmentType::ArrayAny);
        assert_eq!(
            Segment::from_value(json!([])).segment_type(),
            SegmentType::ArrayAny
        );
    }

    #[test]
    fn test_get_path_into_object() {
        let seg = Segment::from_value(json!({"user": {"name": "ada", "age": 36}}));
        let name = seg.get_path(&["user".into(), "name".into()]);
        assert_eq!(name, Some(Segment::String("ada".into())));
        assert!(seg.get_path(&["missing".into()]).is_none());
    }

    #[test]
    fn test_file_attributes_and_markdown() {
        let file = File::remote("diagram.PNG", "https://files.example/d.png");
        assert_eq!(file.extension.as_deref(), Some(".png"));
        assert!(file.is_image());
        let seg = Segment::File(file);
        assert_eq!(
            seg.get_path(&["name".into()]),
            Some(Segment::String("diagram.PNG".into()))
        );
        assert_eq!(seg.text(), "![diagram.PNG](https://files.example/d.png)");
    }

    #[test]
    fn test_type_acceptance() {
        assert!(SegmentType::Number.accepts(SegmentType::Integer));
        assert!(SegmentType::Number.accepts(SegmentType::Float));
        assert!(!SegmentType::Integer.accepts(SegmentType::String));
        assert!(SegmentType::ArrayString.accepts(SegmentType::ArrayAny));
        assert!(SegmentType::Any.accepts(SegmentType::Object));
    }

    #[test]
    fn test_typed_construction_coerces_file() {
        let seg = Segment::from_value_typed(
            json!({"filename": "a.txt", "url": "https://x/a.txt"}),
            SegmentType::File,
        );
        assert!(matches!(seg, Some(Segment::File(_))));
        assert!(Segment::from_value_typed(json!("x"), SegmentType::Integer).is_none());
    }

    #[test]
    fn test_items_roundtrip_preserves_types() {
        let seg = Segment::from_value(json!([1, 2.5]));
        let items = seg.items().unwrap();
        assert_eq!(items, vec![Segment::Integer(1), Segment::Float(2.5)]);
        assert_eq!(Segment::from_items(items), seg);
    }
}
