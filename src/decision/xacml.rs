//! XACML 3.0 request encoding and response parsing.
//!
//! Requests are produced in either the XML core schema or the JSON profile.
//! Responses are accepted in both encodings; anything else is rejected.

use quick_xml::{Reader, escape::escape, events::Event};
use serde_json::{Value, json};

use crate::{action::Action, config::PdpFormat, identity::Identity};

const XACML_NS: &str = "urn:oasis:names:tc:xacml:3.0:core:schema:wd-17";
const STRING_TYPE: &str = "http://www.w3.org/2001/XMLSchema#string";

const CATEGORY_SUBJECT: &str = "urn:oasis:names:tc:xacml:1.0:subject-category:access-subject";
const CATEGORY_RESOURCE: &str = "urn:oasis:names:tc:xacml:3.0:attribute-category:resource";
const CATEGORY_ACTION: &str = "urn:oasis:names:tc:xacml:3.0:attribute-category:action";

const ATTR_SUBJECT_ID: &str = "urn:oasis:names:tc:xacml:1.0:subject:subject-id";
const ATTR_ROLE: &str = "urn:oasis:names:tc:xacml:2.0:subject:role";
const ATTR_RESOURCE_ID: &str = "urn:oasis:names:tc:xacml:1.0:resource:resource-id";
const ATTR_RESOURCE_PATH: &str = "urn:fiware:resource:path";
const ATTR_SERVICE: &str = "urn:fiware:resource:service";
const ATTR_SERVICE_PATH: &str = "urn:fiware:resource:servicepath";
const ATTR_ACTION_ID: &str = "urn:oasis:names:tc:xacml:1.0:action:action-id";

/// Decision values defined by XACML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XacmlDecision {
    Permit,
    Deny,
    NotApplicable,
    Indeterminate,
}

impl XacmlDecision {
    fn parse(value: &str) -> Result<Self, ParseError> {
        match value.trim() {
            "Permit" => Ok(Self::Permit),
            "Deny" => Ok(Self::Deny),
            "NotApplicable" => Ok(Self::NotApplicable),
            "Indeterminate" => Ok(Self::Indeterminate),
            other => Err(ParseError::UnknownDecision(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permit => "Permit",
            Self::Deny => "Deny",
            Self::NotApplicable => "NotApplicable",
            Self::Indeterminate => "Indeterminate",
        }
    }
}

/// Why a PDP response body could not be turned into a decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported response format ({0})")]
    Unsupported(String),

    #[error("malformed body: {0}")]
    Malformed(String),

    #[error("response carries no Decision")]
    MissingDecision,

    #[error("unknown decision value '{0}'")]
    UnknownDecision(String),
}

/// Resource id for an action: `fiware:<component>:<tenant>:<subservice>::`.
pub fn resource_id(component: &str, action: &Action) -> String {
    format!(
        "fiware:{}:{}:{}::",
        component, action.tenant, action.subservice_path
    )
}

/// Content type of a request in the given format.
pub fn content_type(format: PdpFormat) -> &'static str {
    match format {
        PdpFormat::XacmlXml => "application/xml",
        PdpFormat::XacmlJson => "application/json",
    }
}

/// Encode the decision request.
pub fn build_request(
    format: PdpFormat,
    component: &str,
    action: &Action,
    identity: &Identity,
) -> String {
    let resource_id = resource_id(component, action);
    let resource = [
        (ATTR_RESOURCE_ID, resource_id.as_str()),
        (ATTR_RESOURCE_PATH, action.resource_path.as_str()),
        (ATTR_SERVICE, action.tenant.as_str()),
        (ATTR_SERVICE_PATH, action.subservice_path.as_str()),
    ];

    match format {
        PdpFormat::XacmlXml => build_xml(action, identity, &resource),
        PdpFormat::XacmlJson => build_json(action, identity, &resource),
    }
}

fn xml_attribute(out: &mut String, id: &str, value: &str) {
    out.push_str(&format!(
        "<Attribute AttributeId=\"{id}\" IncludeInResult=\"false\">\
         <AttributeValue DataType=\"{STRING_TYPE}\">{}</AttributeValue>\
         </Attribute>",
        escape(value)
    ));
}

fn build_xml(action: &Action, identity: &Identity, resource: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(&format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Request xmlns=\"{XACML_NS}\" CombinedDecision=\"false\" ReturnPolicyIdList=\"false\">"
    ));

    out.push_str(&format!("<Attributes Category=\"{CATEGORY_SUBJECT}\">"));
    xml_attribute(&mut out, ATTR_SUBJECT_ID, &identity.subject_id);
    for role in &identity.roles {
        xml_attribute(&mut out, ATTR_ROLE, role);
    }
    out.push_str("</Attributes>");

    out.push_str(&format!("<Attributes Category=\"{CATEGORY_RESOURCE}\">"));
    for (id, value) in resource {
        xml_attribute(&mut out, id, value);
    }
    out.push_str("</Attributes>");

    out.push_str(&format!("<Attributes Category=\"{CATEGORY_ACTION}\">"));
    xml_attribute(&mut out, ATTR_ACTION_ID, &action.verb);
    out.push_str("</Attributes>");

    out.push_str("</Request>");
    out
}

fn build_json(action: &Action, identity: &Identity, resource: &[(&str, &str)]) -> String {
    let roles: Vec<&str> = identity.roles.iter().map(String::as_str).collect();
    let resource: Vec<Value> = resource
        .iter()
        .map(|(id, value)| json!({ "AttributeId": id, "Value": value }))
        .collect();

    json!({
        "Request": {
            "AccessSubject": {
                "Attribute": [
                    { "AttributeId": ATTR_SUBJECT_ID, "Value": identity.subject_id },
                    { "AttributeId": ATTR_ROLE, "DataType": STRING_TYPE, "Value": roles }
                ]
            },
            "Resource": { "Attribute": resource },
            "Action": {
                "Attribute": [
                    { "AttributeId": ATTR_ACTION_ID, "Value": action.verb }
                ]
            }
        }
    })
    .to_string()
}

enum BodyFormat {
    Xml,
    Json,
}

fn detect_format(content_type: Option<&str>, body: &[u8]) -> Result<BodyFormat, ParseError> {
    if let Some(ct) = content_type.map(str::to_ascii_lowercase) {
        if ct.contains("json") {
            return Ok(BodyFormat::Json);
        }
        if ct.contains("xml") {
            return Ok(BodyFormat::Xml);
        }
    }

    match body.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => Ok(BodyFormat::Json),
        Some(b'<') => Ok(BodyFormat::Xml),
        _ => Err(ParseError::Unsupported(
            content_type.unwrap_or("no content type").to_string(),
        )),
    }
}

/// Parse a PDP response body.
///
/// When a response carries several results, the first non-`Permit` one wins.
pub fn parse_response(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<XacmlDecision, ParseError> {
    let decisions = match detect_format(content_type, body)? {
        BodyFormat::Xml => xml_decisions(body)?,
        BodyFormat::Json => json_decisions(body)?,
    };

    combine(decisions)
}

fn combine(decisions: Vec<XacmlDecision>) -> Result<XacmlDecision, ParseError> {
    if decisions.is_empty() {
        return Err(ParseError::MissingDecision);
    }
    Ok(decisions
        .into_iter()
        .find(|d| *d != XacmlDecision::Permit)
        .unwrap_or(XacmlDecision::Permit))
}

/// Collects `Response/Result/Decision` values. Elements are matched by local
/// name so any namespace prefix is accepted.
fn xml_decisions(body: &[u8]) -> Result<Vec<XacmlDecision>, ParseError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut saw_root = false;
    let mut decision_text: Option<String> = None;
    let mut decisions = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                enter(&path, &mut saw_root, &name)?;
                if is_decision(&path, &name) {
                    decision_text = Some(String::new());
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = e.local_name().as_ref().to_vec();
                enter(&path, &mut saw_root, &name)?;
                if is_decision(&path, &name) {
                    return Err(ParseError::UnknownDecision(String::new()));
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(text) = decision_text.as_mut() {
                    let unescaped = t
                        .unescape()
                        .map_err(|e| ParseError::Malformed(e.to_string()))?;
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::End(_)) => {
                path.pop()
                    .ok_or_else(|| ParseError::Malformed("unbalanced end tag".into()))?;
                if let Some(text) = decision_text.take_if(|_| path.len() == 2) {
                    decisions.push(XacmlDecision::parse(&text)?);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ParseError::Malformed(format!(
                    "at byte {}: {e}",
                    reader.error_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(ParseError::Malformed("empty document".into()));
    }
    if !path.is_empty() {
        return Err(ParseError::Malformed("unexpected end of document".into()));
    }
    Ok(decisions)
}

/// Records the root element, which must be `Response`.
fn enter(path: &[Vec<u8>], saw_root: &mut bool, name: &[u8]) -> Result<(), ParseError> {
    if path.is_empty() {
        if *saw_root {
            return Err(ParseError::Malformed("more than one root element".into()));
        }
        if name != b"Response" {
            return Err(ParseError::Malformed(format!(
                "root element is <{}>, expected <Response>",
                String::from_utf8_lossy(name)
            )));
        }
        *saw_root = true;
    }
    Ok(())
}

fn is_decision(path: &[Vec<u8>], name: &[u8]) -> bool {
    name == b"Decision" && path.len() == 2 && path[1] == b"Result"
}

fn json_decisions(body: &[u8]) -> Result<Vec<XacmlDecision>, ParseError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let results: Vec<&Value> = match value.get("Response") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        Some(_) => {
            return Err(ParseError::Malformed(
                "'Response' must be an object or array".into(),
            ));
        }
        None => return Err(ParseError::MissingDecision),
    };

    results
        .into_iter()
        .map(|result| match result.get("Decision") {
            Some(Value::String(s)) => XacmlDecision::parse(s),
            Some(other) => Err(ParseError::UnknownDecision(other.to_string())),
            None => Err(ParseError::MissingDecision),
        })
        .collect()
}
