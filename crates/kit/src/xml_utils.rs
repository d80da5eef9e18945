//! XML utilities using quick-xml for parsing and regenerating libvirt documents
//!
//! libvirt hands out domain, volume and pool descriptions as XML. This module
//! parses them into a small DOM that keeps attribute order and unknown
//! elements intact, so a document can be edited in a few places and written
//! back without losing anything the caller did not touch.

use color_eyre::{eyre::eyre, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::fmt;
use std::io::Cursor;

/// A builder for creating XML documents with quick-xml
pub struct XmlWriter {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl fmt::Debug for XmlWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmlWriter").finish_non_exhaustive()
    }
}

impl XmlWriter {
    /// Create a new XML writer
    pub fn new() -> Self {
        Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        }
    }

    /// Start an XML element with attributes
    pub fn start_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.writer
            .write_event(Event::Start(elem))
            .map_err(|e| eyre!("Failed to write start element: {}", e))?;
        Ok(())
    }

    /// Write a self-closing element with attributes
    pub fn write_empty_element(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attributes {
            elem.push_attribute((*key, *value));
        }
        self.writer
            .write_event(Event::Empty(elem))
            .map_err(|e| eyre!("Failed to write empty element: {}", e))?;
        Ok(())
    }

    /// Write text content
    pub fn write_text(&mut self, text: &str) -> Result<()> {
        if !text.is_empty() {
            self.writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(|e| eyre!("Failed to write text: {}", e))?;
        }
        Ok(())
    }

    /// End an XML element
    pub fn end_element(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| eyre!("Failed to write end element: {}", e))?;
        Ok(())
    }

    /// Write a parsed node and all of its descendants
    pub fn write_node(&mut self, node: &XmlNode) -> Result<()> {
        let attributes: Vec<(&str, &str)> = node
            .attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if node.children.is_empty() && node.text.is_empty() {
            return self.write_empty_element(&node.name, &attributes);
        }
        self.start_element(&node.name, &attributes)?;
        self.write_text(&node.text)?;
        for child in &node.children {
            self.write_node(child)?;
        }
        self.end_element(&node.name)
    }

    /// Get the generated XML as a string
    pub fn into_string(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| eyre!("Failed to convert XML to string: {}", e))
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple DOM node for XML parsing
///
/// Attributes are kept in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    /// Element name, including any namespace prefix
    pub name: String,
    /// Attributes in the order they appeared
    pub attributes: Vec<(String, String)>,
    /// Concatenated text content directly inside this element
    pub text: String,
    /// Child elements
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Create an empty element
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// First direct child with the given name
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First direct child with the given name, mutably
    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All direct children with the given name, in document order
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// All direct children with the given name, mutably
    pub fn children_named_mut<'a>(
        &'a mut self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut XmlNode> {
        self.children.iter_mut().filter(move |c| c.name == name)
    }

    /// Follow a `/`-separated path of direct children, e.g. `os/nvram`
    pub fn find_path(&self, path: &str) -> Option<&XmlNode> {
        path.split('/')
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Mutable variant of [`XmlNode::find_path`]
    pub fn find_path_mut(&mut self, path: &str) -> Option<&mut XmlNode> {
        path.split('/')
            .try_fold(self, |node, segment| node.child_mut(segment))
    }

    /// Return the first direct child named `name`, appending it if missing
    pub fn ensure_child(&mut self, name: &str) -> &mut XmlNode {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.children.push(XmlNode::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }

    /// Remove every direct child with the given name, returning how many were removed
    pub fn remove_children(&mut self, name: &str) -> usize {
        let before = self.children.len();
        self.children.retain(|c| c.name != name);
        before - self.children.len()
    }

    /// Look up an attribute value
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing the value in place if it already exists
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((key.to_owned(), value)),
        }
    }

    /// Remove an attribute, returning its previous value
    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let idx = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(idx).1)
    }

    /// Get text content of this node
    pub fn text_content(&self) -> &str {
        &self.text
    }

    /// Serialize this node (and its subtree) back to an XML string
    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = XmlWriter::new();
        writer.write_node(self)?;
        writer.into_string()
    }
}

fn node_from_start(e: &BytesStart<'_>) -> Result<XmlNode> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut node = XmlNode::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| eyre!("Invalid attribute: {}", e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| eyre!("Invalid attribute value for {}: {}", key, e))?
            .into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

/// Parse XML string into a simple DOM structure
pub fn parse_xml_dom(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(node_from_start(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let node = node_from_start(&e)?;

                // Add to parent or set as root
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                } else if root.is_none() {
                    root = Some(node);
                }
            }
            Ok(Event::End(_)) => {
                if let Some(completed_node) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(completed_node);
                    } else {
                        root = Some(completed_node);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| eyre!("Invalid text content: {}", e))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(eyre!("Failed to parse XML: {}", e)),
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(eyre!("Unterminated element <{}>", stack[0].name));
    }
    root.ok_or_else(|| eyre!("No root element found in XML"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_writer_basic() {
        let mut writer = XmlWriter::new();
        writer.start_element("root", &[]).unwrap();
        writer.start_element("name", &[]).unwrap();
        writer.write_text("test").unwrap();
        writer.end_element("name").unwrap();
        writer
            .write_empty_element("disk", &[("type", "file")])
            .unwrap();
        writer.end_element("root").unwrap();

        let xml = writer.into_string().unwrap();
        assert!(xml.contains("<root>"));
        assert!(xml.contains("<name>test</name>"));
        assert!(xml.contains("<disk type=\"file\"/>"));
        assert!(xml.contains("</root>"));
    }

    #[test]
    fn test_attribute_order_survives_roundtrip() {
        let xml = r#"<graphics type="vnc" port="5901" autoport="no" listen="0.0.0.0"/>"#;
        let dom = parse_xml_dom(xml).unwrap();
        let keys: Vec<&str> = dom.attributes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["type", "port", "autoport", "listen"]);
        assert_eq!(dom.to_xml_string().unwrap(), xml);
    }

    #[test]
    fn test_escaped_values() {
        let xml = r#"<domain><description>a &amp; b</description><disk name="x&lt;y"/></domain>"#;
        let dom = parse_xml_dom(xml).unwrap();
        assert_eq!(dom.child("description").unwrap().text_content(), "a & b");
        assert_eq!(dom.child("disk").unwrap().attr("name"), Some("x<y"));
        // Re-serializing escapes again rather than doubling up
        let reparsed = parse_xml_dom(&dom.to_xml_string().unwrap()).unwrap();
        assert_eq!(reparsed, dom);
    }

    #[test]
    fn test_find_path_and_edit() {
        let xml = r#"
            <domain>
                <os>
                    <type arch="x86_64">hvm</type>
                    <nvram>/var/lib/libvirt/qemu/nvram/vm_VARS.fd</nvram>
                </os>
            </domain>
        "#;
        let mut dom = parse_xml_dom(xml).unwrap();
        assert_eq!(
            dom.find_path("os/nvram").map(|n| n.text_content()),
            Some("/var/lib/libvirt/qemu/nvram/vm_VARS.fd")
        );
        assert!(dom.find_path("os/loader").is_none());

        dom.find_path_mut("os/nvram").unwrap().text = "/tmp/other.fd".into();
        dom.find_path_mut("os/type").unwrap().set_attr("arch", "aarch64");
        dom.find_path_mut("os/type").unwrap().set_attr("machine", "virt");
        let ty = dom.find_path("os/type").unwrap();
        assert_eq!(
            ty.attributes,
            vec![
                ("arch".to_string(), "aarch64".to_string()),
                ("machine".to_string(), "virt".to_string())
            ]
        );
        assert_eq!(
            dom.find_path("os/nvram").unwrap().text_content(),
            "/tmp/other.fd"
        );
    }

    #[test]
    fn test_remove_children_and_attrs() {
        let mut dom =
            parse_xml_dom(r#"<interface type="network"><mac address="52:54:00:00:00:01"/><target dev="vnet0"/><target dev="vnet1"/></interface>"#)
                .unwrap();
        assert_eq!(dom.remove_children("target"), 2);
        assert_eq!(dom.remove_children("target"), 0);
        assert_eq!(dom.remove_attr("type").as_deref(), Some("network"));
        assert_eq!(dom.remove_attr("type"), None);
        assert_eq!(
            dom.to_xml_string().unwrap(),
            r#"<interface><mac address="52:54:00:00:00:01"/></interface>"#
        );
    }

    #[test]
    fn test_ensure_child() {
        let mut dom = parse_xml_dom("<domain><name>a</name></domain>").unwrap();
        dom.ensure_child("uuid").text = "x".into();
        dom.ensure_child("name").text = "b".into();
        assert_eq!(
            dom.to_xml_string().unwrap(),
            "<domain><name>b</name><uuid>x</uuid></domain>"
        );
    }

    #[test]
    fn test_unterminated() {
        assert!(parse_xml_dom("<domain><name>a</name>").is_err());
        assert!(parse_xml_dom("").is_err());
    }
}
