//! A minimal XML document tree, built with `quick-xml`.
//!
//! UPnP documents are small, so they are read into an owned [`Element`] tree and navigated by
//! local (namespace prefix free) element names.

use quick_xml::{
    Reader,
    events::{BytesStart, Event, attributes::AttrError},
};
use snafu::{ResultExt, Snafu};

/// Errors reading an XML document.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum XmlError {
    #[snafu(display("Invalid XML"))]
    Read { source: quick_xml::Error },
    #[snafu(display("Invalid XML attribute"))]
    Attribute { source: AttrError },
    #[snafu(display("Unbalanced XML document"))]
    Unbalanced,
    #[snafu(display("XML document has no root element"))]
    Empty,
}

/// An XML element with its attributes, child elements and text content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Qualified name, including any namespace prefix.
    pub name: String,
    /// Attributes in document order, with unescaped values.
    pub attributes: Vec<(String, String)>,
    /// Child elements in document order.
    pub children: Vec<Element>,
    /// Concatenated, unescaped text content. Surrounding whitespace is trimmed.
    pub text: String,
}

impl Element {
    /// Parses a document and returns its root element.
    pub fn parse(document: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(document);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;
        loop {
            match reader.read_event().context(xml_error::ReadSnafu)? {
                Event::Start(start) => stack.push(Self::open(&start)?),
                Event::Empty(start) => {
                    let element = Self::open(&start)?;
                    Self::close(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| xml_error::UnbalancedSnafu.build())?;
                    Self::close(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&text.unescape().context(xml_error::ReadSnafu)?);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                // declarations, comments, processing instructions, doctype
                _ => {}
            }
        }

        snafu::ensure!(stack.is_empty(), xml_error::UnbalancedSnafu);
        root.ok_or_else(|| xml_error::EmptySnafu.build())
    }

    fn open(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.context(xml_error::AttributeSnafu)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .context(xml_error::ReadSnafu)?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Element {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    fn close(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                // only the first top level element is kept
                root.get_or_insert(element);
            }
        }
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }

    /// First child whose local name is `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    /// Every child whose local name is `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.local_name() == name)
    }

    /// Text of the first child named `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Value of the attribute `name`, compared by local name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| local_name(key) == name)
            .map(|(_, value)| value.as_str())
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}
