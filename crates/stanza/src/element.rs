use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(String),
    #[error("truncated XML document")]
    Truncated,
    #[error("unexpected XML content: {0}")]
    Unexpected(String),
}

impl From<quick_xml::Error> for XmlError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Syntax(err.to_string())
    }
}

/// A lightweight XML element tree: the name as it appeared on the wire
/// (prefix included), attributes in document order, child elements and
/// character data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name, value));
        }
    }

    /// The qualified name, eg `db:result`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name with any namespace prefix stripped, eg `result`.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The first child whose local name matches.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parse one complete element from `data`. Surrounding whitespace is
    /// tolerated; anything after the closing tag is ignored.
    pub fn parse(data: &[u8]) -> Result<Element, XmlError> {
        let mut reader = Reader::from_reader(data);
        reader.config_mut().trim_text(true);
        reader.config_mut().check_end_names = false;

        let mut stack: Vec<Element> = vec![];
        loop {
            match reader.read_event() {
                Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
                | Ok(Event::DocType(_)) => {}
                Ok(Event::Start(tag)) => {
                    stack.push(element_from_tag(&tag)?);
                }
                Ok(Event::Empty(tag)) => {
                    let element = element_from_tag(&tag)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Text(text)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text.unescape()?);
                    }
                }
                Ok(Event::CData(data)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text
                            .push_str(&String::from_utf8_lossy(data.as_ref()));
                    }
                }
                Ok(Event::End(_)) => {
                    let element = match stack.pop() {
                        Some(element) => element,
                        None => {
                            return Err(XmlError::Unexpected(
                                "closing tag without an opening tag".to_string(),
                            ))
                        }
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Eof) => return Err(XmlError::Truncated),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Serialize back to XML with attribute and text escaping.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        let _ = write!(out, "<{}", self.name);
        for (name, value) in &self.attrs {
            let _ = write!(
                out,
                " {}=\"{}\"",
                name,
                quick_xml::escape::escape(value.as_str())
            );
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if !self.text.is_empty() {
            let _ = write!(out, "{}", quick_xml::escape::escape(self.text.as_str()));
        }
        for child in &self.children {
            child.write_xml(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

/// Build an attribute-only element from a start tag, without requiring
/// the tag's content or closing counterpart to be present. Stream
/// headers are parsed this way.
pub fn element_from_tag(tag: &BytesStart) -> Result<Element, XmlError> {
    let name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    let mut element = Element::new(name);
    for attr in tag.attributes() {
        let attr = attr.map_err(|err| XmlError::Syntax(err.to_string()))?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| XmlError::Syntax(err.to_string()))?
            .to_string();
        element.attrs.push((name, value));
    }
    Ok(element)
}
