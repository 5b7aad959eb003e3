use std::borrow::Cow;
use std::io::{Read, Write};

use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;
use xmltree::{Element, XMLNode};

use crate::errors::DavError;

pub(crate) trait ElementExt {
    /// Builder.
    fn new2<'a, E: Into<&'a str>>(e: E) -> Self;
    /// Builder.
    fn ns<S: Into<String>>(self, prefix: S, namespace: S) -> Self;
    /// Builder.
    fn text<T: Into<String>>(self, t: T) -> Self;
    /// Like parse, but returns DavError.
    fn parse2<R: Read>(r: R) -> Result<Element, DavError>;
    /// Add a child element.
    fn push_element(&mut self, e: Element);
    /// Iterator over the children that are Elements.
    fn child_elems_iter<'a>(&'a self) -> Box<dyn Iterator<Item = &'a Element> + 'a>;
    /// Iterator over the children that are Elements, consuming.
    fn child_elems_into_iter(self) -> Box<dyn Iterator<Item = Element>>;
    /// Is this `name` in the DAV: namespace.
    fn is_dav(&self, name: &str) -> bool;
    /// Write the element using an EventWriter.
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()>;
}

impl ElementExt for Element {
    fn ns<S: Into<String>>(mut self, prefix: S, namespace: S) -> Element {
        let mut ns = self.namespaces.unwrap_or_else(xml::namespace::Namespace::empty);
        ns.force_put(prefix.into(), namespace.into());
        self.namespaces = Some(ns);
        self
    }

    fn new2<'a, N: Into<&'a str>>(n: N) -> Element {
        let v: Vec<&str> = n.into().splitn(2, ':').collect();
        if v.len() == 1 {
            Element::new(v[0])
        } else {
            let mut e = Element::new(v[1]);
            e.prefix = Some(v[0].to_string());
            e
        }
    }

    fn text<S: Into<String>>(mut self, t: S) -> Element {
        let t = t.into();
        self.children = if t.is_empty() {
            Vec::new()
        } else {
            vec![XMLNode::Text(t)]
        };
        self
    }

    fn parse2<R: Read>(r: R) -> Result<Element, DavError> {
        match Element::parse(r) {
            Ok(elem) => Ok(elem),
            Err(xmltree::ParseError::MalformedXml(_)) => Err(DavError::XmlParseError),
            Err(_) => Err(DavError::XmlReadError),
        }
    }

    fn push_element(&mut self, e: Element) {
        self.children.push(XMLNode::Element(e));
    }

    fn child_elems_iter<'a>(&'a self) -> Box<dyn Iterator<Item = &'a Element> + 'a> {
        Box::new(self.children.iter().filter_map(|n| match n {
            XMLNode::Element(e) => Some(e),
            _ => None,
        }))
    }

    fn child_elems_into_iter(self) -> Box<dyn Iterator<Item = Element>> {
        Box::new(self.children.into_iter().filter_map(|n| match n {
            XMLNode::Element(e) => Some(e),
            _ => None,
        }))
    }

    fn is_dav(&self, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some("DAV:")
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()> {
        use xml::attribute::Attribute;
        use xml::name::Name;
        use xml::namespace::Namespace;

        let mut name = Name::local(&self.name);
        if let Some(ref ns) = self.namespace {
            name.namespace = Some(ns);
        }
        if let Some(ref p) = self.prefix {
            name.prefix = Some(p);
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for (k, v) in &self.attributes {
            attributes.push(Attribute {
                name: Name::local(k),
                value: v,
            });
        }

        let empty_ns = Namespace::empty();
        let namespace = match self.namespaces {
            Some(ref ns) => Cow::Borrowed(ns),
            None => Cow::Borrowed(&empty_ns),
        };

        emitter.write(XmlWEvent::StartElement {
            name,
            attributes: Cow::Owned(attributes),
            namespace,
        })?;
        for node in &self.children {
            match node {
                XMLNode::Element(elem) => elem.write_ev(emitter)?,
                XMLNode::Text(text) => emitter.write(XmlWEvent::Characters(text))?,
                XMLNode::CData(text) => emitter.write(XmlWEvent::CData(text))?,
                XMLNode::Comment(_) | XMLNode::ProcessingInstruction(..) => {}
            }
        }
        emitter.write(XmlWEvent::EndElement { name: Some(name) })?;

        Ok(())
    }
}

/// An EventWriter with the settings used for every response body:
/// no indentation, no self-closing shortcuts, utf-8 declaration written.
pub(crate) fn emitter<W: Write>(w: W) -> xml::writer::Result<EventWriter<W>> {
    let mut emitter = EventWriter::new_with_config(
        w,
        EmitterConfig {
            normalize_empty_elements: false,
            perform_indent: false,
            indent_string: Cow::Borrowed(""),
            ..Default::default()
        },
    );
    emitter.write(XmlWEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    Ok(emitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_build_and_write() {
        let mut e = Element::new2("D:prop").ns("D", "DAV:");
        e.push_element(Element::new2("D:getetag").text("abc"));
        e.push_element(Element::new2("D:resourcetype"));
        assert_eq!(e.child_elems_iter().count(), 2);

        let mut em = emitter(Vec::new()).unwrap();
        e.write_ev(&mut em).unwrap();
        let s = String::from_utf8(em.into_inner()).unwrap();
        assert!(s.contains("<D:prop xmlns:D=\"DAV:\">"));
        assert!(s.contains("<D:getetag>abc</D:getetag>"));
        assert!(s.contains("<D:resourcetype></D:resourcetype>"));
    }

    #[test]
    fn test_parse2() {
        let x = r#"<?xml version="1.0"?><D:propfind xmlns:D="DAV:"><D:allprop/></D:propfind>"#;
        let e = Element::parse2(Cursor::new(x)).unwrap();
        assert!(e.is_dav("propfind"));
        let c = e.child_elems_into_iter().next().unwrap();
        assert!(c.is_dav("allprop"));

        assert!(matches!(
            Element::parse2(Cursor::new("<D:propfind xmlns:D=\"DAV:\">")),
            Err(DavError::XmlParseError)
        ));
    }
}
