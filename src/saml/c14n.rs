//! Namespace-aware XML tree and Exclusive XML Canonicalization 1.0
//! (without comments).
//!
//! Signed SAML fragments inherit namespace declarations from their
//! enclosing document, so canonical bytes are produced from a parsed tree
//! with the in-scope namespaces of every ancestor tracked, never from a
//! substring of the original text.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeSet, HashMap};

pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("document type declarations are not accepted")]
    Doctype,

    #[error("undeclared namespace prefix: {0}")]
    UnboundPrefix(String),
}

fn malformed(e: impl std::fmt::Display) -> XmlError {
    XmlError::Malformed(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written, e.g. `saml:Assertion`.
    pub name: String,
    /// Attributes in document order, namespace declarations included.
    attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(malformed)?
            .to_string();

        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(malformed)?;
            let key = std::str::from_utf8(attr.key.as_ref()).map_err(malformed)?.to_string();
            let raw = std::str::from_utf8(&attr.value).map_err(malformed)?;
            // Attribute-value normalization: literal whitespace becomes a space,
            // character references keep their character.
            let normalized = raw.replace("\r\n", " ").replace(['\t', '\n', '\r'], " ");
            let value = quick_xml::escape::unescape(&normalized).map_err(malformed)?;
            attributes.push((key, value.into_owned()));
        }

        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    pub fn prefix(&self) -> &str {
        self.name.split_once(':').map(|(p, _)| p).unwrap_or("")
    }

    pub fn local_name(&self) -> &str {
        self.name.split_once(':').map(|(_, l)| l).unwrap_or(&self.name)
    }

    /// Value of a non-namespace attribute by qualified name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attributes other than namespace declarations.
    fn plain_attributes(&self) -> impl Iterator<Item = &(String, String)> {
        self.attributes
            .iter()
            .filter(|(key, _)| key != "xmlns" && !key.starts_with("xmlns:"))
    }

    /// Namespace declarations as `(prefix, uri)`, the default namespace as `""`.
    fn declarations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(key, value)| {
            if key == "xmlns" {
                Some(("", value.as_str()))
            } else {
                key.strip_prefix("xmlns:").map(|prefix| (prefix, value.as_str()))
            }
        })
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// Concatenated text of direct children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|child| match child {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Whether this element, seen from its parent's `inherited` scope, is
    /// `{namespace}local`.
    pub fn is(&self, inherited: &Scope, namespace: &str, local: &str) -> bool {
        self.local_name() == local && inherited.enter(self).namespace(self.prefix()) == Some(namespace)
    }
}

/// In-scope namespace bindings at some point of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope(HashMap<String, String>);

impl Default for Scope {
    fn default() -> Self {
        let mut bindings = HashMap::new();
        bindings.insert("xml".to_string(), XML_NS.to_string());
        Self(bindings)
    }
}

impl Scope {
    /// Bindings visible inside `element`.
    pub fn enter(&self, element: &Element) -> Scope {
        let mut bindings = self.0.clone();
        for (prefix, uri) in element.declarations() {
            bindings.insert(prefix.to_string(), uri.to_string());
        }
        Scope(bindings)
    }

    /// Namespace bound to `prefix`; an empty default namespace is `None`.
    pub fn namespace(&self, prefix: &str) -> Option<&str> {
        self.0.get(prefix).map(String::as_str).filter(|uri| !uri.is_empty())
    }
}

/// Element located in a document together with the scope it inherits.
#[derive(Debug, Clone)]
pub struct Located<'a> {
    pub element: &'a Element,
    pub inherited: Scope,
}

impl<'a> Located<'a> {
    /// Scope visible inside the element.
    pub fn scope(&self) -> Scope {
        self.inherited.enter(self.element)
    }

    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.element.is(&self.inherited, namespace, local)
    }

    /// Direct children named `{namespace}local`.
    pub fn children(&self, namespace: &str, local: &str) -> Vec<Located<'a>> {
        let scope = self.scope();
        self.element
            .child_elements()
            .filter(|child| child.is(&scope, namespace, local))
            .map(|element| Located {
                element,
                inherited: scope.clone(),
            })
            .collect()
    }

    pub fn child(&self, namespace: &str, local: &str) -> Option<Located<'a>> {
        self.children(namespace, local).into_iter().next()
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    root: Element,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event().map_err(malformed)? {
                Event::Start(start) => stack.push(Element::from_start(&start)?),
                Event::Empty(start) => attach(&mut stack, &mut root, Element::from_start(&start)?)?,
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let raw = std::str::from_utf8(&text).map_err(malformed)?;
                        let normalized = normalize_newlines(raw);
                        let value = quick_xml::escape::unescape(&normalized).map_err(malformed)?;
                        parent.children.push(Node::Text(value.into_owned()));
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let raw = std::str::from_utf8(&data).map_err(malformed)?;
                        parent.children.push(Node::Text(normalize_newlines(raw)));
                    }
                }
                Event::DocType(_) => return Err(XmlError::Doctype),
                Event::Eof => break,
                // Declarations, comments and processing instructions are not signed content
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(malformed("unclosed element"));
        }
        root.map(|root| Self { root }).ok_or_else(|| malformed("no root element"))
    }

    pub fn root(&self) -> Located<'_> {
        Located {
            element: &self.root,
            inherited: Scope::default(),
        }
    }

    /// Every element in document order.
    pub fn descendants(&self) -> Vec<Located<'_>> {
        let mut found = Vec::new();
        collect(&self.root, &Scope::default(), &mut found);
        found
    }
}

fn collect<'a>(element: &'a Element, inherited: &Scope, found: &mut Vec<Located<'a>>) {
    let scope = inherited.enter(element);
    found.push(Located {
        element,
        inherited: inherited.clone(),
    });
    for child in element.child_elements() {
        collect(child, &scope, found);
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_some() => return Err(malformed("multiple root elements")),
        None => *root = Some(element),
    }
    Ok(())
}

fn normalize_newlines(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

/// Exclusive canonical form of `located`.
///
/// `exclude` is omitted from the output along with its subtree (the
/// enveloped-signature transform). `inclusive_prefixes` is the
/// `InclusiveNamespaces PrefixList`, `#default` naming the default namespace.
pub fn canonicalize(
    located: &Located<'_>,
    exclude: Option<&Element>,
    inclusive_prefixes: &[String],
) -> Result<String, XmlError> {
    let inclusive: Vec<&str> = inclusive_prefixes
        .iter()
        .map(|p| if p == "#default" { "" } else { p.as_str() })
        .collect();
    let mut out = String::new();
    write_element(
        &mut out,
        located.element,
        &located.inherited,
        &HashMap::new(),
        exclude,
        &inclusive,
    )?;
    Ok(out)
}

fn write_element(
    out: &mut String,
    element: &Element,
    inherited: &Scope,
    rendered: &HashMap<String, String>,
    exclude: Option<&Element>,
    inclusive: &[&str],
) -> Result<(), XmlError> {
    let scope = inherited.enter(element);

    let mut utilized: BTreeSet<&str> = BTreeSet::new();
    utilized.insert(element.prefix());
    for (key, _) in element.plain_attributes() {
        if let Some((prefix, _)) = key.split_once(':') {
            utilized.insert(prefix);
        }
    }
    utilized.remove("xml");

    for prefix in &utilized {
        if !prefix.is_empty() && scope.namespace(prefix).is_none() {
            return Err(XmlError::UnboundPrefix(prefix.to_string()));
        }
    }
    for prefix in inclusive {
        if scope.namespace(prefix).is_some() {
            utilized.insert(prefix);
        }
    }

    let mut output_scope = rendered.clone();
    let mut declarations: Vec<(&str, &str)> = Vec::new();
    for prefix in utilized {
        let uri = scope.namespace(prefix).unwrap_or("");
        let already = rendered.get(prefix).map(String::as_str).unwrap_or("");
        if uri != already {
            declarations.push((prefix, uri));
            output_scope.insert(prefix.to_string(), uri.to_string());
        }
    }

    let mut attributes: Vec<(&str, &str, &str, &str)> = Vec::new();
    for (key, value) in element.plain_attributes() {
        let (namespace, local) = match key.split_once(':') {
            Some((prefix, local)) => (scope.namespace(prefix).unwrap_or(""), local),
            None => ("", key.as_str()),
        };
        attributes.push((namespace, local, key, value));
    }
    attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    out.push('<');
    out.push_str(&element.name);
    for (prefix, uri) in declarations {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        escape_attribute(out, uri);
        out.push('"');
    }
    for (_, _, key, value) in attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attribute(out, value);
        out.push('"');
    }
    out.push('>');

    for child in &element.children {
        match child {
            Node::Text(text) => escape_text(out, text),
            Node::Element(child) => {
                if exclude.is_some_and(|excluded| std::ptr::eq(excluded, child)) {
                    continue;
                }
                write_element(out, child, &scope, &output_scope, exclude, inclusive)?;
            }
        }
    }

    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
    Ok(())
}

fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}
