use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl Part {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: data.into(),
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    fn effective_content_type(&self) -> Option<&str> {
        match (&self.content_type, &self.file_name) {
            (Some(content_type), _) => Some(content_type),
            (None, Some(_)) => Some("application/octet-stream"),
            (None, None) => None,
        }
    }
}

/// `multipart/form-data` payload. The boundary is fixed at construction so
/// every retry of a call sends identical bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let boundary = format!(
            "apiwire-{:016x}{:016x}",
            rng.random::<u64>(),
            rng.random::<u64>()
        );
        Self::with_boundary(boundary)
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.part(Part::text(name, value))
    }

    pub fn part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        for part in &self.parts {
            buffer.put_slice(b"--");
            buffer.put_slice(self.boundary.as_bytes());
            buffer.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
            buffer.put_slice(escape_quoted(&part.name).as_bytes());
            buffer.put_u8(b'"');
            if let Some(file_name) = &part.file_name {
                buffer.put_slice(b"; filename=\"");
                buffer.put_slice(escape_quoted(file_name).as_bytes());
                buffer.put_u8(b'"');
            }
            buffer.put_slice(b"\r\n");
            if let Some(content_type) = part.effective_content_type() {
                buffer.put_slice(b"Content-Type: ");
                buffer.put_slice(content_type.as_bytes());
                buffer.put_slice(b"\r\n");
            }
            buffer.put_slice(b"\r\n");
            buffer.put_slice(&part.data);
            buffer.put_slice(b"\r\n");
        }
        buffer.put_slice(b"--");
        buffer.put_slice(self.boundary.as_bytes());
        buffer.put_slice(b"--\r\n");
        buffer.freeze()
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
