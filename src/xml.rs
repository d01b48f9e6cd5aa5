//! GameStream's `<root status_code="...">...</root>` response bodies.
//!
//! Every HTTP/HTTPS endpoint replies with the same shallow envelope, so this
//! wraps `xml-rs`'s event writer instead of each endpoint hand-assembling a
//! string. Not a general-purpose serialiser: the schema moonlight clients
//! expect is small and fixed.

use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

pub struct RootWriter {
    writer: EventWriter<Vec<u8>>,
}

impl RootWriter {
    pub fn new(status_code: u32) -> Self {
        let mut writer = EmitterConfig::new()
            .write_document_declaration(false)
            .create_writer(Vec::new());
        writer
            .write(XmlEvent::start_element("root").attr("status_code", &status_code.to_string()))
            .expect("writing to an in-memory buffer cannot fail");
        Self { writer }
    }

    pub fn elem(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.child_elem(name, value);
        self
    }

    /// Write `name` as a parent element, invoking `body` to fill its
    /// children (used for `SupportedDisplayMode` and `App` lists).
    pub fn with_children(mut self, name: &str, body: impl FnOnce(&mut Self)) -> Self {
        self.writer
            .write(XmlEvent::start_element(name))
            .expect("writing to an in-memory buffer cannot fail");
        body(&mut self);
        self.writer
            .write(XmlEvent::end_element())
            .expect("writing to an in-memory buffer cannot fail");
        self
    }

    /// Like `with_children`, but callable from inside another closure
    /// (e.g. one `DisplayMode` entry inside `SupportedDisplayMode`).
    pub fn child_nest(&mut self, name: &str, body: impl FnOnce(&mut Self)) {
        self.writer
            .write(XmlEvent::start_element(name))
            .expect("writing to an in-memory buffer cannot fail");
        body(self);
        self.writer
            .write(XmlEvent::end_element())
            .expect("writing to an in-memory buffer cannot fail");
    }

    pub fn child_elem(&mut self, name: &str, value: impl std::fmt::Display) {
        let text = value.to_string();
        self.writer
            .write(XmlEvent::start_element(name))
            .expect("writing to an in-memory buffer cannot fail");
        self.writer
            .write(XmlEvent::characters(&text))
            .expect("writing to an in-memory buffer cannot fail");
        self.writer
            .write(XmlEvent::end_element())
            .expect("writing to an in-memory buffer cannot fail");
    }

    pub fn finish(mut self) -> String {
        self.writer
            .write(XmlEvent::end_element())
            .expect("writing to an in-memory buffer cannot fail");
        String::from_utf8(self.writer.into_inner()).expect("xml-rs emits valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_flat_elements_with_status_attr() {
        let xml = RootWriter::new(200).elem("paired", 1).elem("plaincert", "abcd").finish();
        assert!(xml.starts_with("<root status_code=\"200\">"));
        assert!(xml.contains("<paired>1</paired>"));
        assert!(xml.contains("<plaincert>abcd</plaincert>"));
        assert!(xml.ends_with("</root>"));
    }

    #[test]
    fn renders_nested_list_children() {
        let xml = RootWriter::new(200)
            .with_children("SupportedDisplayMode", |w| {
                w.child_elem("Width", 1920);
                w.child_elem("Height", 1080);
            })
            .finish();
        assert!(xml.contains("<SupportedDisplayMode><Width>1920</Width><Height>1080</Height></SupportedDisplayMode>"));
    }
}
