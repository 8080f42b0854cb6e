//! XML bodies as JSON trees, so one path language covers both formats.
//!
//! Conversion rules: the root element is unwrapped; child elements become
//! object keys; repeated children become arrays; attributes become `@name`
//! keys; text of an element that also has attributes or children is stored
//! under `#text`; a text-only element is its text.

use anyhow::Context as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::{Map, Value};

struct Node {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> anyhow::Result<Self> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).to_string();
        let mut fields = Map::new();
        for attr in start.attributes() {
            let attr = attr.with_context(|| format!("malformed attribute on <{name}>"))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            let value = attr.unescape_value()?.to_string();
            fields.insert(format!("@{key}"), Value::String(value));
        }
        Ok(Self {
            name,
            fields,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let value = if self.fields.is_empty() {
            Value::String(self.text)
        } else {
            let mut fields = self.fields;
            if !self.text.is_empty() {
                fields.insert("#text".to_string(), Value::String(self.text));
            }
            Value::Object(fields)
        };
        (self.name, value)
    }
}

fn attach(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

/// Parses `xml` into a JSON value following the module's conversion rules.
///
/// # Errors
///
/// Returns an error for malformed XML or a document without a root element.
pub fn xml_to_json(xml: &str) -> anyhow::Result<Value> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Value> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => stack.push(Node::open(e)?),
            Ok(Event::Empty(ref e)) => {
                let (name, value) = Node::open(e)?.close();
                match stack.last_mut() {
                    Some(parent) => attach(&mut parent.fields, name, value),
                    None => root = Some(value),
                }
            }
            Ok(Event::Text(ref e)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&e.unescape()?);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().context("unbalanced closing tag")?;
                let (name, value) = node.close();
                match stack.last_mut() {
                    Some(parent) => attach(&mut parent.fields, name, value),
                    None => root = Some(value),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "XML parse error at position {}: {e}",
                    reader.buffer_position()
                ))
            }
            Ok(_) => {}
        }
    }

    if !stack.is_empty() {
        anyhow::bail!("unexpected end of XML document");
    }
    root.context("XML document has no root element")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn repeated_children_become_arrays() {
        let xml = r#"<?xml version="1.0"?>
            <response total="2">
              <items>
                <item id="1"><title>A &amp; B</title></item>
                <item id="2"><title>C</title></item>
              </items>
              <page_number>1</page_number>
            </response>"#;
        let v = xml_to_json(xml).unwrap();
        assert_eq!(v["@total"], json!("2"));
        assert_eq!(v["page_number"], json!("1"));
        let items = v["items"]["item"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["@id"], json!("1"));
        assert_eq!(items[0]["title"], json!("A & B"));
    }

    #[test]
    fn single_child_stays_an_object() {
        let v = xml_to_json("<r><items><item><id>7</id></item></items></r>").unwrap();
        assert_eq!(v["items"]["item"]["id"], json!("7"));
    }

    #[test]
    fn text_alongside_attributes_goes_under_hash_text() {
        let v = xml_to_json(r#"<r><price currency="EUR">9.99</price><flag/></r>"#).unwrap();
        assert_eq!(v["price"]["@currency"], json!("EUR"));
        assert_eq!(v["price"]["#text"], json!("9.99"));
        assert_eq!(v["flag"], json!(""));
    }

    #[test]
    fn cdata_is_text() {
        let v = xml_to_json("<r><body><![CDATA[<b>raw</b>]]></body></r>").unwrap();
        assert_eq!(v["body"], json!("<b>raw</b>"));
    }

    #[test]
    fn malformed_documents_are_errors() {
        assert!(xml_to_json("<r><a></r>").is_err());
        assert!(xml_to_json("").is_err());
        assert!(xml_to_json("<r><a>").is_err());
    }
}
