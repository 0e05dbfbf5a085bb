//! XML documents, XML Schema (XSD) and WSDL
//!
//! Documents are read with `quick-xml` into a small element tree. The tree
//! keeps elements, attributes and non-whitespace text; comments, processing
//! instructions, the declaration and the doctype are dropped, and CDATA
//! sections become plain text.

use std::collections::{BTreeMap, HashSet};

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::compatibility::{Breaks, ChangeType, SchemaChange, VersionedContent};
use crate::content::Content;
use crate::error::Result;
use crate::executor::Stage;
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

use super::{is_remote, utf8, FormatRules};

pub static XML_RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Xml,
    canonicalize,
    extract_references: no_references,
    validate: validate_xml,
    diff: diff_xml,
};

pub static XSD_RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Xsd,
    canonicalize,
    extract_references: extract_xsd_references,
    validate: validate_xsd,
    diff: diff_xsd,
};

pub static WSDL_RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Wsdl,
    canonicalize,
    extract_references: extract_wsdl_references,
    validate: validate_wsdl,
    diff: diff_wsdl,
};

const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
const WSDL11_NAMESPACE: &str = "http://schemas.xmlsoap.org/wsdl/";
const WSDL20_NAMESPACE: &str = "http://www.w3.org/ns/wsdl";

const XSD_COMPONENTS: &[&str] = &["element", "complexType", "simpleType", "group", "attributeGroup", "attribute"];

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> std::result::Result<Self, String> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| format!("Invalid attribute on <{}>: {}", name, e))?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| format!("Invalid value for attribute '{}': {}", key, e))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    fn local_name(&self) -> &str {
        local(&self.name)
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Namespace of this element, from declarations on the element itself
    fn namespace(&self) -> Option<&str> {
        match self.name.split_once(':') {
            Some((prefix, _)) => self.attribute(&format!("xmlns:{}", prefix)),
            None => self.attribute("xmlns"),
        }
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Every element below this one, depth first
    fn descendants(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        let mut stack: Vec<&Element> = self.elements().collect();
        stack.reverse();
        while let Some(element) = stack.pop() {
            out.push(element);
            let mut children: Vec<&Element> = element.elements().collect();
            children.reverse();
            stack.extend(children);
        }
        out
    }
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn location(text: &str, offset: usize) -> String {
    let before = &text.as_bytes()[..offset.min(text.len())];
    let line = before.iter().filter(|b| **b == b'\n').count() + 1;
    let column = before.iter().rev().take_while(|b| **b != b'\n').count() + 1;
    format!("{}:{}", line, column)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> std::result::Result<(), String> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None if root.is_some() => Err(format!("Document has more than one root element; found <{}>", element.name)),
        None => {
            *root = Some(element);
            Ok(())
        }
    }
}

fn attach_text(stack: &mut [Element], text: String) -> std::result::Result<(), String> {
    if text.trim().is_empty() {
        return Ok(());
    }
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Text(text));
            Ok(())
        }
        None => Err("Text content outside the root element".to_string()),
    }
}

/// Well-formed document tree, or one parse violation
fn parse_document(text: &str, budget: &StageBudget) -> Result<std::result::Result<Element, RuleViolation>> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    let malformed = |message: String, offset: usize| {
        Ok(Err(RuleViolation::parse_error(format!("Malformed XML: {}", message)).at(location(text, offset))))
    };

    loop {
        budget.check()?;
        let offset = reader.buffer_position();
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => return malformed(e.to_string(), reader.buffer_position()),
        };
        let step = match event {
            Event::Start(start) => {
                budget.check_depth(stack.len() + 1)?;
                match Element::from_start(&start) {
                    Ok(element) if stack.is_empty() && root.is_some() => {
                        Err(format!("Document has more than one root element; found <{}>", element.name))
                    }
                    Ok(element) => {
                        stack.push(element);
                        Ok(())
                    }
                    Err(message) => Err(message),
                }
            }
            Event::Empty(start) => {
                budget.check_depth(stack.len() + 1)?;
                Element::from_start(&start).and_then(|element| attach(&mut stack, &mut root, element))
            }
            Event::End(end) => match stack.pop() {
                Some(element) => attach(&mut stack, &mut root, element),
                None => Err(format!(
                    "Closing tag </{}> has no matching opening tag",
                    String::from_utf8_lossy(end.name().as_ref())
                )),
            },
            Event::Text(t) => match t.unescape() {
                Ok(value) => attach_text(&mut stack, value.into_owned()),
                Err(e) => Err(format!("Invalid character data: {}", e)),
            },
            Event::CData(data) => attach_text(&mut stack, String::from_utf8_lossy(&data.into_inner()).into_owned()),
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => Ok(()),
            Event::Eof => break,
        };
        if let Err(message) = step {
            return malformed(message, offset);
        }
    }

    if let Some(open) = stack.last() {
        return malformed(format!("Element <{}> is never closed", open.name), text.len());
    }
    match root {
        Some(root) => Ok(Ok(root)),
        None => malformed("Document has no root element".to_string(), 0),
    }
}

fn parse_content(content: &Content, budget: &StageBudget) -> Result<std::result::Result<Element, RuleViolation>> {
    match utf8(content) {
        Ok(text) => parse_document(text, budget),
        Err(violation) => Ok(Err(violation)),
    }
}

fn canonicalize(content: &Content, budget: &StageBudget) -> Result<Option<Vec<u8>>> {
    let Ok(root) = parse_content(content, budget)? else {
        return Ok(None);
    };
    let mut writer = Writer::new(Vec::new());
    if write_element(&mut writer, &root).is_err() {
        return Ok(None);
    }
    Ok(Some(writer.into_inner()))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> quick_xml::Result<()> {
    let mut attributes: Vec<&(String, String)> = element.attributes.iter().collect();
    attributes.sort();
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() {
        return writer.write_event(Event::Empty(start));
    }
    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        match child {
            Node::Element(e) => write_element(writer, e)?,
            Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
        }
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))
}

fn no_references(_content: &Content) -> Vec<ReferenceCoordinate> {
    Vec::new()
}

fn collect_locations(content: &Content, locators: &[(&str, &str)]) -> Vec<ReferenceCoordinate> {
    let budget = StageBudget::unbounded(Stage::ResolvingReferences);
    let Ok(Ok(root)) = parse_content(content, &budget) else {
        return Vec::new();
    };
    std::iter::once(&root)
        .chain(root.descendants())
        .filter_map(|e| {
            locators
                .iter()
                .filter(|(element, _)| e.local_name() == *element)
                .find_map(|(_, attribute)| e.attribute(attribute))
        })
        .filter(|location| !location.is_empty() && !is_remote(location))
        .map(ReferenceCoordinate::new)
        .collect()
}

const SCHEMA_LOCATORS: &[(&str, &str)] = &[
    ("import", "schemaLocation"),
    ("include", "schemaLocation"),
    ("redefine", "schemaLocation"),
    ("override", "schemaLocation"),
];

fn extract_xsd_references(content: &Content) -> Vec<ReferenceCoordinate> {
    collect_locations(content, SCHEMA_LOCATORS)
}

fn extract_wsdl_references(content: &Content) -> Vec<ReferenceCoordinate> {
    let mut locators = vec![("import", "location"), ("include", "location")];
    locators.extend_from_slice(SCHEMA_LOCATORS);
    collect_locations(content, &locators)
}

fn validate_xml(content: &Content, _level: ValidityLevel, _references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    Ok(parse_content(content, budget)?.err().into_iter().collect())
}

fn validate_xsd(content: &Content, level: ValidityLevel, _references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let root = match parse_content(content, budget)? {
        Ok(root) => root,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = Vec::new();
    if root.local_name() != "schema" || root.namespace() != Some(XSD_NAMESPACE) {
        violations.push(RuleViolation::semantic(
            format!("Root element must be 'schema' in the {} namespace, found <{}>", XSD_NAMESPACE, root.name),
            format!("/{}", root.name),
        ));
    }

    let mut seen = HashSet::new();
    for (kind, name, _) in xsd_components(&root) {
        // elements, types and groups live in separate symbol spaces
        let space = match kind {
            "complexType" | "simpleType" => "type",
            other => other,
        };
        if !seen.insert((space, name)) {
            violations.push(RuleViolation::semantic(
                format!("Top-level {} '{}' is declared more than once", kind, name),
                format!("/{}/{}[@name='{}']", root.name, kind, name),
            ));
        }
    }
    Ok(violations)
}

fn validate_wsdl(content: &Content, level: ValidityLevel, _references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let root = match parse_content(content, budget)? {
        Ok(root) => root,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = Vec::new();
    let valid_root = matches!(
        (root.local_name(), root.namespace()),
        ("definitions", Some(WSDL11_NAMESPACE)) | ("description", Some(WSDL20_NAMESPACE))
    );
    if !valid_root {
        violations.push(RuleViolation::semantic(
            format!(
                "Root element must be WSDL 1.1 'definitions' or WSDL 2.0 'description', found <{}>",
                root.name
            ),
            format!("/{}", root.name),
        ));
    }

    for (port_type, operations) in wsdl_interfaces(&root) {
        let mut seen = HashSet::new();
        for operation in operations {
            if !seen.insert(operation) {
                violations.push(RuleViolation::semantic(
                    format!("Operation '{}' is declared more than once in '{}'", operation, port_type),
                    format!("{}/{}", port_type, operation),
                ));
            }
        }
    }
    Ok(violations)
}

/// Named top-level schema components as `(kind, name, element)`
fn xsd_components(root: &Element) -> Vec<(&str, &str, &Element)> {
    root.elements()
        .filter(|e| XSD_COMPONENTS.contains(&e.local_name()))
        .filter_map(|e| e.attribute("name").map(|name| (e.local_name(), name, e)))
        .collect()
}

/// Port types (1.1) or interfaces (2.0) with their operation names
fn wsdl_interfaces(root: &Element) -> Vec<(&str, Vec<&str>)> {
    root.elements()
        .filter(|e| matches!(e.local_name(), "portType" | "interface"))
        .filter_map(|e| {
            let operations = e
                .elements()
                .filter(|op| op.local_name() == "operation")
                .filter_map(|op| op.attribute("name"))
                .collect();
            e.attribute("name").map(|name| (name, operations))
        })
        .collect()
}

type Pair = std::result::Result<(Element, Element), SchemaChange>;

fn load_pair(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Pair> {
    let old = match parse_content(prior.content, budget)? {
        Ok(root) => root,
        Err(v) => return Ok(Err(SchemaChange::unparsable("prior", v.description))),
    };
    let new = match parse_content(candidate.content, budget)? {
        Ok(root) => root,
        Err(v) => return Ok(Err(SchemaChange::unparsable("candidate", v.description))),
    };
    Ok(Ok((old, new)))
}

fn diff_xml(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let (old, new) = match load_pair(prior, candidate, budget)? {
        Ok(pair) => pair,
        Err(change) => return Ok(vec![change]),
    };
    if old.name == new.name {
        return Ok(Vec::new());
    }
    Ok(vec![SchemaChange::new(
        ChangeType::TypeChanged,
        "/",
        Breaks::Both,
        format!("Root element changed from <{}> to <{}>", old.name, new.name),
    )
    .with_values(&old.name, &new.name)])
}

fn diff_xsd(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let (old, new) = match load_pair(prior, candidate, budget)? {
        Ok(pair) => pair,
        Err(change) => return Ok(vec![change]),
    };
    let new_components: BTreeMap<(&str, &str), &Element> =
        xsd_components(&new).into_iter().map(|(kind, name, e)| ((kind, name), e)).collect();
    let mut changes = Vec::new();

    for (kind, name, old_component) in xsd_components(&old) {
        budget.check()?;
        let path = format!("/{}/{}[@name='{}']", old.name, kind, name);
        match new_components.get(&(kind, name)) {
            Some(new_component) => diff_particles(&path, old_component, new_component, &mut changes),
            None => changes.push(SchemaChange::new(
                ChangeType::TypeRemoved,
                path,
                Breaks::Backward,
                format!("Top-level {} '{}' was removed", kind, name),
            )),
        }
    }
    Ok(changes)
}

/// Local element declarations inside a component, by name
fn local_elements(component: &Element) -> BTreeMap<&str, &Element> {
    component
        .descendants()
        .into_iter()
        .filter(|e| e.local_name() == "element")
        .filter_map(|e| e.attribute("name").map(|name| (name, e)))
        .collect()
}

fn diff_particles(path: &str, old: &Element, new: &Element, out: &mut Vec<SchemaChange>) {
    let (old_elements, new_elements) = (local_elements(old), local_elements(new));

    for (name, old_element) in &old_elements {
        let element_path = format!("{}//element[@name='{}']", path, name);
        let Some(new_element) = new_elements.get(name) else {
            out.push(SchemaChange::new(
                ChangeType::FieldRemoved,
                element_path,
                Breaks::Backward,
                format!("Element '{}' was removed from {}", name, path),
            ));
            continue;
        };
        let (old_type, new_type) = (old_element.attribute("type"), new_element.attribute("type"));
        if old_type != new_type {
            let show = |t: Option<&str>| t.unwrap_or("anonymous").to_string();
            out.push(
                SchemaChange::new(
                    ChangeType::TypeChanged,
                    &element_path,
                    Breaks::Both,
                    format!("Element '{}' changed type from '{}' to '{}'", name, show(old_type), show(new_type)),
                )
                .with_values(show(old_type), show(new_type)),
            );
        }
    }

    for (name, new_element) in &new_elements {
        let optional = new_element.attribute("minOccurs") == Some("0");
        if !old_elements.contains_key(name) && !optional {
            out.push(SchemaChange::new(
                ChangeType::FieldAdded,
                format!("{}//element[@name='{}']", path, name),
                Breaks::Backward,
                format!("Required element '{}' was added to {}", name, path),
            ));
        }
    }
}

fn diff_wsdl(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let (old, new) = match load_pair(prior, candidate, budget)? {
        Ok(pair) => pair,
        Err(change) => return Ok(vec![change]),
    };
    let new_interfaces: BTreeMap<&str, Vec<&str>> = wsdl_interfaces(&new).into_iter().collect();
    let mut changes = Vec::new();

    for (name, operations) in wsdl_interfaces(&old) {
        budget.check()?;
        let Some(new_operations) = new_interfaces.get(name) else {
            changes.push(SchemaChange::new(
                ChangeType::OperationRemoved,
                name,
                Breaks::Backward,
                format!("Port type '{}' was removed", name),
            ));
            continue;
        };
        for operation in operations.iter().filter(|op| !new_operations.contains(*op)) {
            changes.push(SchemaChange::new(
                ChangeType::OperationRemoved,
                format!("{}/{}", name, operation),
                Breaks::Backward,
                format!("Operation '{}' was removed from port type '{}'", operation, name),
            ));
        }
    }
    Ok(changes)
}
