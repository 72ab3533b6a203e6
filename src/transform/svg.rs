//! SVG fragments for the engine.
//!
//! The source is parsed with `quick-xml` into a small element tree, stripped
//! of everything that does not render (prolog, doctype, comments, metadata,
//! editor data) and written back without formatting whitespace. Text is kept
//! verbatim; only whitespace-only text between tags is dropped, and not even
//! that below `xml:space="preserve"`.
//!
//! Inkscape documents whose root holds nothing but `<defs>` and more than one
//! layer are split into one artifact per layer, each keeping the shared
//! `<defs>`.

use std::borrow::Cow;
use std::str;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::transform::{Artifact, ArtifactDescriptor, TransformRequest, Transformer};

const CODE: &str = "engineSvg";

pub struct SvgTransformer;

#[async_trait]
impl Transformer for SvgTransformer {
    async fn transform(&self, request: &TransformRequest) -> anyhow::Result<ArtifactDescriptor> {
        tracing::debug!(source = %request.source, "reading");
        let source = tokio::fs::read_to_string(&request.source).await?;
        optimize(&request.coord.file, &source)
    }
}

/// Produces the artifacts of one SVG document named `file`.
pub fn optimize(file: &str, source: &str) -> anyhow::Result<ArtifactDescriptor> {
    let nodes = parse(source)?;

    let root = nodes
        .iter()
        .find_map(|node| match node {
            Node::Element(element) if element.name == "svg" => Some(element),
            _ => None,
        })
        .ok_or_else(|| anyhow!("The file contains no root element."))?;

    let elements: Vec<&Element> = root
        .children
        .iter()
        .filter_map(|node| match node {
            Node::Element(element) if !is_editor_only(&element.name) => Some(element),
            _ => None,
        })
        .collect();

    if elements.is_empty() {
        bail!("The root element contains no elements.");
    }

    let shared: Vec<&Element> = elements.iter().copied().filter(|e| e.name == "defs").collect();
    let layers: Vec<&Element> = elements
        .iter()
        .copied()
        .filter(|e| e.name == "g" && e.attr("inkscape:groupmode") == Some("layer"))
        .collect();

    let is_inkscape = shared.len() + layers.len() == elements.len();
    let mut descriptor = ArtifactDescriptor::new();

    if is_inkscape && layers.len() > 1 {
        tracing::debug!(file, layers = layers.len(), "splitting by Inkscape layer");

        for layer in layers {
            // Labels are used verbatim; two layers with the same label would
            // overwrite each other, so the descriptor rejects them.
            let label = layer.attr("inkscape:label").unwrap_or_default();

            // Hidden layers are shown again once split out.
            let mut layer = layer.clone();
            layer.attrs.retain(|(key, _)| key != "style");

            let page = Element {
                name: root.name.clone(),
                attrs: root.attrs.clone(),
                children: shared
                    .iter()
                    .map(|defs| Node::Element((*defs).clone()))
                    .chain([Node::Element(layer)])
                    .collect(),
            };

            let mut out = String::new();
            page.write(&mut out, false);
            descriptor.insert(format!("{file}/{label}"), artifact(out))?;
        }
    } else {
        let mut out = String::new();
        root.write(&mut out, false);
        descriptor.insert(file, artifact(out))?;
    }

    Ok(descriptor)
}

fn artifact(data: String) -> Artifact {
    Artifact::NonAudio {
        code: CODE.into(),
        data,
    }
}

fn is_editor_only(name: &str) -> bool {
    matches!(name, "metadata" | "title" | "desc") || name.starts_with("sodipodi:")
}

fn is_editor_attr(name: &str) -> bool {
    name.starts_with("sodipodi:")
        || name.starts_with("inkscape:")
        || name == "xmlns:sodipodi"
        || name == "xmlns:inkscape"
}

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    /// Markup as found in the source, entities and CDATA sections included.
    Text(String),
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    /// Values are kept escaped, exactly as written in the source.
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn from_tag(tag: &BytesStart) -> anyhow::Result<Self> {
        let name = str::from_utf8(tag.name().as_ref())?.to_owned();

        let mut attrs = Vec::new();
        for attr in tag.attributes() {
            let attr = attr?;
            attrs.push((
                str::from_utf8(attr.key.as_ref())?.to_owned(),
                str::from_utf8(&attr.value)?.to_owned(),
            ));
        }

        Ok(Self {
            name,
            attrs,
            children: Vec::new(),
        })
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Writes the element unless it is editor data. `preserve` is the
    /// `xml:space` mode inherited from the parent.
    fn write(&self, out: &mut String, preserve: bool) {
        if is_editor_only(&self.name) {
            return;
        }

        let preserve = match self.attr("xml:space") {
            Some("preserve") => true,
            Some("default") => false,
            _ => preserve,
        };

        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            if is_editor_attr(key) {
                continue;
            }
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&quote(value));
            out.push('"');
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');

        for child in &self.children {
            match child {
                Node::Element(element) => element.write(out, preserve),
                Node::Text(text) if !preserve && text.trim().is_empty() => {}
                Node::Text(text) => out.push_str(text),
            }
        }

        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

fn quote(value: &str) -> Cow<'_, str> {
    if value.contains('"') {
        Cow::Owned(value.replace('"', "&quot;"))
    } else {
        Cow::Borrowed(value)
    }
}

/// Reads a document into a node forest.
fn parse(source: &str) -> anyhow::Result<Vec<Node>> {
    fn push(stack: &mut [Element], roots: &mut Vec<Node>, node: Node) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    let mut reader = Reader::from_str(source);
    let mut stack: Vec<Element> = Vec::new();
    let mut roots: Vec<Node> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| anyhow!("Malformed markup at byte {}: {e}", reader.buffer_position()))?;

        match event {
            Event::Start(tag) => stack.push(Element::from_tag(&tag)?),
            Event::Empty(tag) => {
                let element = Element::from_tag(&tag)?;
                push(&mut stack, &mut roots, Node::Element(element));
            }
            Event::End(tag) => {
                let element = stack.pop().ok_or_else(|| {
                    let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                    anyhow!("Unexpected closing tag '{name}'.")
                })?;
                push(&mut stack, &mut roots, Node::Element(element));
            }
            Event::Text(text) => {
                let text = str::from_utf8(&text)?.to_owned();
                push(&mut stack, &mut roots, Node::Text(text));
            }
            Event::CData(data) => {
                let text = format!("<![CDATA[{}]]>", str::from_utf8(&data)?);
                push(&mut stack, &mut roots, Node::Text(text));
            }
            Event::Eof => break,
            // Prolog, doctype, comments and processing instructions.
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        bail!("Element '{}' is never closed.", open.name);
    }

    Ok(roots)
}
