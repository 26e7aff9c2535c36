//! Owned, mutable XML element tree.
//!
//! Parsed with roxmltree, which is read-only; the tree here is what the
//! definition rewrite operates on. Namespace declarations are kept as
//! ordinary `xmlns`/`xmlns:*` attributes and element names keep their
//! source prefix, so serialization reproduces the input's vocabulary.
//! Comments and processing instructions are dropped.

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn parse(xml: &str) -> Result<Self, roxmltree::Error> {
        let doc = roxmltree::Document::parse(xml)?;
        Ok(convert(doc.root_element()))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.name == name)
    }

    /// Returns the first child named `name`, appending an empty one if absent.
    pub fn ensure_child(&mut self, name: &str) -> &mut Element {
        let idx = match self
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if e.name == name))
        {
            Some(idx) => idx,
            None => {
                self.children.push(Node::Element(Element::new(name)));
                self.children.len() - 1
            }
        };
        match &mut self.children[idx] {
            Node::Element(e) => e,
            Node::Text(_) => unreachable!("index points at an element"),
        }
    }

    pub fn retain_elements(&mut self, mut keep: impl FnMut(&Element) -> bool) {
        self.children.retain(|n| match n {
            Node::Element(e) => keep(e),
            Node::Text(_) => true,
        });
    }

    /// Concatenated text content of direct children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn set_text(&mut self, text: &str) {
        self.children = vec![Node::Text(text.to_string())];
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            let _ = write!(out, " {k}=\"{}\"", escape(v, true));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_into(out),
                Node::Text(t) => out.push_str(&escape(t, false)),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

fn qualified(node: roxmltree::Node, ns: Option<&str>, local: &str) -> String {
    match ns.and_then(|uri| node.lookup_prefix(uri)) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{local}"),
        _ => local.to_string(),
    }
}

fn convert(node: roxmltree::Node) -> Element {
    let tag = node.tag_name();
    let mut el = Element::new(qualified(node, tag.namespace(), tag.name()));

    // roxmltree reports every namespace in scope; only declare the ones the
    // parent did not already have.
    let inherited: Vec<(Option<&str>, &str)> = node
        .parent_element()
        .map(|p| p.namespaces().map(|ns| (ns.name(), ns.uri())).collect())
        .unwrap_or_default();
    for ns in node.namespaces() {
        if ns.name() == Some("xml") || inherited.contains(&(ns.name(), ns.uri())) {
            continue;
        }
        let key = match ns.name() {
            Some(prefix) => format!("xmlns:{prefix}"),
            None => "xmlns".to_string(),
        };
        el.attributes.push((key, ns.uri().to_string()));
    }

    for attr in node.attributes() {
        el.attributes.push((
            qualified(node, attr.namespace(), attr.name()),
            attr.value().to_string(),
        ));
    }

    for child in node.children() {
        if child.is_element() {
            el.children.push(Node::Element(convert(child)));
        } else if child.is_text()
            && let Some(text) = child.text()
        {
            el.children.push(Node::Text(text.to_string()));
        }
    }
    el
}

fn escape(s: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_serialize_preserves_structure() {
        let src = r#"<domain type="kvm"><name>vm</name><devices><disk device="disk"/></devices></domain>"#;
        let el = Element::parse(src).unwrap();
        assert_eq!(el.to_xml(), src);
    }

    #[test]
    fn escapes_text_and_attributes() {
        let mut el = Element::new("description").with_attr("title", "a \"b\" & c");
        el.set_text("x < y && z");
        assert_eq!(
            el.to_xml(),
            r#"<description title="a &quot;b&quot; &amp; c">x &lt; y &amp;&amp; z</description>"#
        );
    }

    #[test]
    fn namespaces_are_declared_once() {
        let src = r#"<domain><metadata><lo:os xmlns:lo="http://libosinfo.org/xmlns/libvirt/domain/1.0"><lo:id>x</lo:id></lo:os></metadata></domain>"#;
        let el = Element::parse(src).unwrap();
        assert_eq!(el.to_xml(), src);
    }

    #[test]
    fn ensure_child_creates_once() {
        let mut el = Element::new("interface");
        el.ensure_child("mac").set_attr("address", "52:54:00:00:00:01");
        el.ensure_child("mac").set_attr("address", "52:54:00:00:00:02");
        assert_eq!(el.elements().count(), 1);
        assert_eq!(
            el.child("mac").and_then(|m| m.attr("address")),
            Some("52:54:00:00:00:02")
        );
    }

    #[test]
    fn retain_keeps_whitespace() {
        let mut el = Element::parse("<os>\n  <loader/>\n  <nvram>/x</nvram>\n</os>").unwrap();
        el.retain_elements(|e| e.name != "nvram");
        assert!(el.child("nvram").is_none());
        assert!(el.child("loader").is_some());
        assert!(el.text().contains('\n'));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Element::parse("<domain><name>vm</domain>").is_err());
    }
}
