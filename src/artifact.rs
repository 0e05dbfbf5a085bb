//! Artifact types supported by the registry

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::content::{Content, ContentType};
use crate::error::RuleError;

/// Closed set of content kinds the engine knows how to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    /// Apache Avro schemas (`.avsc`)
    Avro,
    /// Protocol Buffers IDL (`.proto`)
    Protobuf,
    /// JSON Schema
    Json,
    /// OpenAPI / Swagger documents
    Openapi,
    /// AsyncAPI documents
    Asyncapi,
    /// GraphQL SDL
    Graphql,
    /// Kafka Connect JSON schemas
    Kconnect,
    /// WSDL 1.1 / 2.0 service descriptions
    Wsdl,
    /// XML Schema definitions
    Xsd,
    /// Plain XML documents
    Xml,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 10] = [
        ArtifactType::Avro,
        ArtifactType::Protobuf,
        ArtifactType::Json,
        ArtifactType::Openapi,
        ArtifactType::Asyncapi,
        ArtifactType::Graphql,
        ArtifactType::Kconnect,
        ArtifactType::Wsdl,
        ArtifactType::Xsd,
        ArtifactType::Xml,
    ];

    /// Wire name, e.g. `AVRO`
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Avro => "AVRO",
            ArtifactType::Protobuf => "PROTOBUF",
            ArtifactType::Json => "JSON",
            ArtifactType::Openapi => "OPENAPI",
            ArtifactType::Asyncapi => "ASYNCAPI",
            ArtifactType::Graphql => "GRAPHQL",
            ArtifactType::Kconnect => "KCONNECT",
            ArtifactType::Wsdl => "WSDL",
            ArtifactType::Xsd => "XSD",
            ArtifactType::Xml => "XML",
        }
    }

    /// Content type assumed when the caller declares none
    pub fn default_content_type(&self) -> ContentType {
        match self {
            ArtifactType::Avro
            | ArtifactType::Json
            | ArtifactType::Openapi
            | ArtifactType::Asyncapi
            | ArtifactType::Kconnect => ContentType::Json,
            ArtifactType::Protobuf => ContentType::Protobuf,
            ArtifactType::Graphql => ContentType::Graphql,
            ArtifactType::Wsdl | ArtifactType::Xsd | ArtifactType::Xml => ContentType::Xml,
        }
    }

    /// Types whose validators need the transitive closure of their references,
    /// not only the directly declared ones.
    pub fn needs_transitive_references(&self) -> bool {
        matches!(self, ArtifactType::Avro | ArtifactType::Protobuf)
    }

    /// Best-effort detection of the artifact type from content alone
    pub fn detect(content: &Content) -> Option<ArtifactType> {
        let text = content.text()?.trim_start();
        if text.starts_with('<') {
            return Some(detect_xml(text));
        }
        if text.starts_with('{') || text.starts_with('[') || text.starts_with('"') {
            let value: serde_json::Value = serde_json::from_str(text).ok()?;
            return Some(detect_json(&value));
        }
        if let Ok(value) = serde_yaml::from_str::<serde_json::Value>(text) {
            if value.get("openapi").is_some() || value.get("swagger").is_some() {
                return Some(ArtifactType::Openapi);
            }
            if value.get("asyncapi").is_some() {
                return Some(ArtifactType::Asyncapi);
            }
        }
        let proto_markers = ["syntax ", "syntax=", "message ", "package ", "import \""];
        if proto_markers.iter().any(|m| text.contains(m)) && !text.contains("type Query") {
            return Some(ArtifactType::Protobuf);
        }
        let graphql_markers = ["type ", "schema {", "interface ", "scalar ", "input ", "union "];
        if graphql_markers.iter().any(|m| text.contains(m)) {
            return Some(ArtifactType::Graphql);
        }
        None
    }
}

fn detect_json(value: &serde_json::Value) -> ArtifactType {
    if value.get("openapi").is_some() || value.get("swagger").is_some() {
        return ArtifactType::Openapi;
    }
    if value.get("asyncapi").is_some() {
        return ArtifactType::Asyncapi;
    }
    if value.get("$schema").is_some() || value.get("properties").is_some() {
        return ArtifactType::Json;
    }
    let avro_type = value.get("type").and_then(|t| t.as_str());
    if matches!(avro_type, Some("record" | "enum" | "fixed")) || value.is_array() || value.is_string() {
        return ArtifactType::Avro;
    }
    if avro_type == Some("struct") && value.get("fields").is_some() {
        return ArtifactType::Kconnect;
    }
    ArtifactType::Json
}

fn detect_xml(text: &str) -> ArtifactType {
    let head: String = text.chars().take(2048).collect();
    if head.contains("wsdl") && (head.contains(":definitions") || head.contains("<definitions")
        || head.contains(":description") || head.contains("<description"))
    {
        ArtifactType::Wsdl
    } else if head.contains("XMLSchema") && head.contains("schema") {
        ArtifactType::Xsd
    } else {
        ArtifactType::Xml
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avro" | "avsc" => Ok(ArtifactType::Avro),
            "protobuf" | "proto" => Ok(ArtifactType::Protobuf),
            "json" | "json_schema" | "jsonschema" => Ok(ArtifactType::Json),
            "openapi" | "swagger" => Ok(ArtifactType::Openapi),
            "asyncapi" => Ok(ArtifactType::Asyncapi),
            "graphql" | "gql" => Ok(ArtifactType::Graphql),
            "kconnect" | "kafka_connect" => Ok(ArtifactType::Kconnect),
            "wsdl" => Ok(ArtifactType::Wsdl),
            "xsd" => Ok(ArtifactType::Xsd),
            "xml" => Ok(ArtifactType::Xml),
            other => Err(RuleError::Configuration(format!("unknown artifact type: '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_with_aliases() {
        assert_eq!("avro".parse::<ArtifactType>().unwrap(), ArtifactType::Avro);
        assert_eq!("PROTO".parse::<ArtifactType>().unwrap(), ArtifactType::Protobuf);
        assert_eq!("json_schema".parse::<ArtifactType>().unwrap(), ArtifactType::Json);
        assert!("cobol".parse::<ArtifactType>().is_err());
    }

    #[test]
    fn test_display_round_trips_for_all_types() {
        for t in ArtifactType::ALL {
            assert_eq!(t.to_string().parse::<ArtifactType>().unwrap(), t);
        }
    }

    #[test]
    fn test_detect() {
        let avro = Content::from_string(r#"{"type":"record","name":"A","fields":[]}"#);
        assert_eq!(ArtifactType::detect(&avro), Some(ArtifactType::Avro));

        let openapi = Content::from_string("openapi: 3.0.0\ninfo:\n  title: x\n");
        assert_eq!(ArtifactType::detect(&openapi), Some(ArtifactType::Openapi));

        let proto = Content::from_string("syntax = \"proto3\";\nmessage A { int32 x = 1; }");
        assert_eq!(ArtifactType::detect(&proto), Some(ArtifactType::Protobuf));

        let gql = Content::from_string("type Query { hello: String }");
        assert_eq!(ArtifactType::detect(&gql), Some(ArtifactType::Graphql));

        let xsd = Content::from_string(
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"></xs:schema>"#,
        );
        assert_eq!(ArtifactType::detect(&xsd), Some(ArtifactType::Xsd));

        assert_eq!(ArtifactType::detect(&Content::from_bytes(vec![0xff])), None);
    }
}
