//! Utility functions for processing data in the YAML file format
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents every error which can be encountered during YAML (de)serialization.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize YAML"))]
    SerializeYaml { source: serde_yaml::Error },

    #[snafu(display("failed to write YAML document separator"))]
    WriteDocumentSeparator { source: std::io::Error },

    #[snafu(display("failed to parse YAML document #{index}"))]
    ParseDocument {
        source: serde_yaml::Error,
        index: usize,
    },

    #[snafu(display("failed to parse bytes as valid UTF-8 string"))]
    ParseUtf8Bytes { source: std::string::FromUtf8Error },
}

/// Provides configurable options during YAML serialization.
///
/// The default options produce the plain documents the workload binaries read: no leading
/// document marker and externally tagged enums.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerializeOptions {
    /// Adds leading triple dashes (`---`) to the output string.
    pub explicit_document: bool,

    /// Serialize enum variants as YAML maps using the variant name as the key.
    pub singleton_map: bool,
}

impl SerializeOptions {
    /// Options used when printing a stream of Kubernetes objects.
    pub fn manifest() -> Self {
        Self {
            explicit_document: true,
            singleton_map: true,
        }
    }
}

/// Serializes the given data structure and writes it to a [`Writer`](std::io::Write).
///
/// Key order follows the declaration order of the serialized types (or the iteration order of the
/// map types they contain), which keeps the output byte-identical between runs as long as no
/// `HashMap` is involved.
pub fn serialize<T, W>(value: &T, mut writer: W, options: SerializeOptions) -> Result<()>
where
    T: serde::Serialize,
    W: std::io::Write,
{
    if options.explicit_document {
        writer
            .write_all(b"---\n")
            .context(WriteDocumentSeparatorSnafu)?;
    }

    let mut serializer = serde_yaml::Serializer::new(writer);

    if options.singleton_map {
        serde_yaml::with::singleton_map_recursive::serialize(value, &mut serializer)
            .context(SerializeYamlSnafu)?;
    } else {
        value
            .serialize(&mut serializer)
            .context(SerializeYamlSnafu)?;
    }

    Ok(())
}

/// Serializes `value` into a YAML [`String`].
pub fn to_string<T>(value: &T, options: SerializeOptions) -> Result<String>
where
    T: serde::Serialize,
{
    let mut buffer = Vec::new();
    serialize(value, &mut buffer, options)?;
    String::from_utf8(buffer).context(ParseUtf8BytesSnafu)
}

/// Splits a multi-document YAML stream into its documents.
///
/// Empty documents (including documents consisting only of comments) are skipped, so templates
/// which render nothing for a disabled feature do not produce `null` entries.
pub fn parse_documents(input: &str) -> Result<Vec<serde_json::Value>> {
    let mut documents = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(input).enumerate() {
        let value =
            serde_json::Value::deserialize(document).context(ParseDocumentSnafu { index })?;
        if !value.is_null() {
            documents.push(value);
        }
    }

    Ok(documents)
}
