//! OneBot v11 message segments, in both the array and the CQ-code form.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSegment", into = "RawSegment")]
pub enum Segment {
    Text(String),
    /// Mention of a member by QQ number, or `all`
    At(String),
    Image {
        file: String,
        url: Option<String>,
    },
    Video(String),
    /// Rich card payload, e.g. QQ mini-program shares
    Json(String),
    Reply(String),
    Face(String),
    /// Any segment kind we don't interpret, kept verbatim
    Other {
        kind: String,
        data: Map<String, Value>,
    },
}

#[derive(Serialize, Deserialize)]
struct RawSegment {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Map<String, Value>,
}

fn string_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl From<RawSegment> for Segment {
    fn from(raw: RawSegment) -> Self {
        let data = &raw.data;
        let known = match raw.kind.as_str() {
            "text" => string_field(data, "text").map(Segment::Text),
            "at" => string_field(data, "qq").map(Segment::At),
            "image" => string_field(data, "file")
                .or_else(|| string_field(data, "url"))
                .map(|file| Segment::Image {
                    file,
                    url: string_field(data, "url"),
                }),
            "video" => string_field(data, "file").map(Segment::Video),
            "json" => string_field(data, "data").map(Segment::Json),
            "reply" => string_field(data, "id").map(Segment::Reply),
            "face" => string_field(data, "id").map(Segment::Face),
            _ => None,
        };

        known.unwrap_or(Segment::Other {
            kind: raw.kind,
            data: raw.data,
        })
    }
}

impl From<Segment> for RawSegment {
    fn from(segment: Segment) -> Self {
        let single = |kind: &str, key: &str, value: String| {
            let mut data = Map::new();
            data.insert(key.to_owned(), Value::String(value));
            RawSegment {
                kind: kind.to_owned(),
                data,
            }
        };

        match segment {
            Segment::Text(text) => single("text", "text", text),
            Segment::At(qq) => single("at", "qq", qq),
            Segment::Image { file, url } => {
                let mut raw = single("image", "file", file);
                if let Some(url) = url {
                    raw.data.insert("url".to_owned(), Value::String(url));
                }
                raw
            }
            Segment::Video(file) => single("video", "file", file),
            Segment::Json(data) => single("json", "data", data),
            Segment::Reply(id) => single("reply", "id", id),
            Segment::Face(id) => single("face", "id", id),
            Segment::Other { kind, data } => RawSegment { kind, data },
        }
    }
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text(text.into())
    }

    pub fn at(qq: impl Into<String>) -> Self {
        Segment::At(qq.into())
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Segment::Image {
            file: url.into(),
            url: None,
        }
    }

    pub fn video_url(url: impl Into<String>) -> Self {
        Segment::Video(url.into())
    }

    /// Video uploaded inline, so the OneBot side needs no access to our disk.
    pub fn video_bytes(bytes: &[u8]) -> Self {
        Segment::Video(format!("base64://{}", STANDARD.encode(bytes)))
    }

    /// The URL to fetch an image from: the `url` field when present,
    /// otherwise `file` if it looks like one.
    pub fn image_source(&self) -> Option<&str> {
        match self {
            Segment::Image { url: Some(url), .. } => Some(url),
            Segment::Image { file, url: None } if file.starts_with("http") => Some(file),
            _ => None,
        }
    }

    fn write_cq(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Segment::Text(text) = self {
            return f.write_str(&escape(text, false));
        }

        let raw = RawSegment::from(self.clone());
        write!(f, "[CQ:{}", raw.kind)?;
        for (key, value) in &raw.data {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            write!(f, ",{key}={}", escape(&value, true))?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Message(Vec<Segment>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.0.iter()
    }

    pub fn push(&mut self, segment: Segment) {
        self.0.push(segment);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Concatenation of all text segments.
    pub fn plain_text(&self) -> String {
        self.0
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn first_at(&self) -> Option<&str> {
        self.0.iter().find_map(|segment| match segment {
            Segment::At(qq) => Some(qq.as_str()),
            _ => None,
        })
    }

    pub fn at_count(&self) -> usize {
        self.0
            .iter()
            .filter(|segment| matches!(segment, Segment::At(_)))
            .count()
    }

    pub fn first_image(&self) -> Option<&str> {
        self.0.iter().find_map(Segment::image_source)
    }

    pub fn json_payloads(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|segment| match segment {
            Segment::Json(data) => Some(data.as_str()),
            _ => None,
        })
    }

    pub fn to_cq_string(&self) -> String {
        self.to_string()
    }

    /// Parses the CQ-code string form, e.g. `hi [CQ:at,qq=10001]`.
    pub fn parse_cq(raw: &str) -> Self {
        let mut message = Message::new();
        let mut rest = raw;

        while let Some(start) = rest.find("[CQ:") {
            if start > 0 {
                message.push(Segment::Text(unescape(&rest[..start])));
            }
            let code = &rest[start..];
            let Some(end) = code.find(']') else {
                message.push(Segment::Text(unescape(code)));
                rest = "";
                break;
            };
            message.push(parse_code(&code[4..end]));
            rest = &code[end + 1..];
        }

        if !rest.is_empty() {
            message.push(Segment::Text(unescape(rest)));
        }
        message
    }
}

fn parse_code(body: &str) -> Segment {
    let mut parts = body.split(',');
    let kind = parts.next().unwrap_or_default().trim().to_owned();
    let data = parts
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| (key.to_owned(), Value::String(unescape(value))))
        .collect();
    RawSegment { kind, data }.into()
}

fn escape(raw: &str, in_param: bool) -> String {
    let escaped = raw
        .replace('&', "&amp;")
        .replace('[', "&#91;")
        .replace(']', "&#93;");
    if in_param {
        escaped.replace(',', "&#44;")
    } else {
        escaped
    }
}

fn unescape(raw: &str) -> String {
    raw.replace("&#44;", ",")
        .replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&amp;", "&")
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            segment.write_cq(f)?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Segments(Vec<Segment>),
            Cq(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Segments(segments) => Message(segments),
            Repr::Cq(raw) => Message::parse_cq(&raw),
        })
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message(vec![Segment::text(text)])
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message(vec![Segment::Text(text)])
    }
}

impl From<Segment> for Message {
    fn from(segment: Segment) -> Self {
        Message(vec![segment])
    }
}

impl From<Vec<Segment>> for Message {
    fn from(segments: Vec<Segment>) -> Self {
        Message(segments)
    }
}

impl FromIterator<Segment> for Message {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        Message(iter.into_iter().collect())
    }
}

impl Extend<Segment> for Message {
    fn extend<I: IntoIterator<Item = Segment>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Message {
    type Item = Segment;
    type IntoIter = std::vec::IntoIter<Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Message {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
