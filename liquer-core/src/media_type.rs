//! Mapping of file extensions to media (MIME) types and to type identifiers.

pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

const MEDIA_TYPES: &[(&str, &str)] = &[
    ("json", "application/json"),
    ("djson", "application/json"),
    ("ndjson", "application/json"),
    ("js", "text/javascript"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("md", "text/markdown"),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("ods", "application/vnd.oasis.opendocument.spreadsheet"),
    ("tsv", "text/tab-separated-values"),
    ("csv", "text/csv"),
    ("css", "text/css"),
    ("yaml", "application/x-yaml"),
    ("yml", "application/x-yaml"),
    ("toml", "application/toml"),
    ("msgpack", "application/x-msgpack"),
    ("hdf5", "application/x-hdf"),
    ("h5", "application/x-hdf"),
    ("b", "application/octet-stream"),
    ("bin", "application/octet-stream"),
    ("parquet", "application/octet-stream"),
    ("feather", "application/octet-stream"),
    ("wasm", "application/wasm"),
    ("mid", "audio/midi"),
    ("midi", "audio/midi"),
    ("pdf", "application/pdf"),
    ("ps", "application/postscript"),
    ("eps", "image/eps"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("tga", "image/tga"),
    ("tiff", "image/tiff"),
    ("bmp", "image/bmp"),
    ("ico", "image/x-icon"),
    ("gif", "image/gif"),
    ("wmf", "image/wmf"),
    ("aiff", "audio/aiff"),
    ("avi", "video/avi"),
    ("py", "text/x-python"),
    ("rs", "text/x-rust"),
    ("ipynb", "application/x-ipynb+json"),
];

const TYPE_IDENTIFIERS: &[(&str, &str)] = &[
    ("json", "generic"),
    ("djson", "dictionary"),
    ("js", "text"),
    ("txt", "text"),
    ("html", "text"),
    ("htm", "text"),
    ("md", "text"),
    ("yaml", "text"),
    ("yml", "text"),
    ("tsv", "text"),
    ("css", "text"),
    ("svg", "text"),
    ("py", "text"),
    ("rs", "text"),
    ("b", "bytes"),
    ("bin", "bytes"),
    ("ipynb", "generic"),
];

/// Media type for a file extension (without the dot).
/// Unknown extensions map to `application/octet-stream`.
pub fn file_extension_to_media_type(extension: &str) -> &'static str {
    let extension = extension.to_lowercase();
    MEDIA_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, media_type)| *media_type)
        .unwrap_or(DEFAULT_MEDIA_TYPE)
}

/// Type identifier of the data typically stored in a file with the given extension
pub fn file_extension_to_type_identifier(extension: &str) -> Option<&'static str> {
    let extension = extension.to_lowercase();
    TYPE_IDENTIFIERS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, type_identifier)| *type_identifier)
}

/// Extension of a filename, lower-cased
pub fn filename_extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Media types a browser can show inline; everything else is served as an attachment.
pub fn is_inline_media_type(media_type: &str) -> bool {
    media_type.starts_with("text/")
        || media_type.starts_with("image/")
        || media_type == "application/json"
        || media_type == "application/pdf"
        || media_type == "application/x-yaml"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_types() {
        assert_eq!(file_extension_to_media_type("json"), "application/json");
        assert_eq!(file_extension_to_media_type("TXT"), "text/plain");
        assert_eq!(file_extension_to_media_type("xyz"), DEFAULT_MEDIA_TYPE);
        assert_eq!(file_extension_to_type_identifier("djson"), Some("dictionary"));
        assert_eq!(file_extension_to_type_identifier("csv"), None);
    }

    #[test]
    fn extensions() {
        assert_eq!(filename_extension("a.tar.GZ"), Some("gz".to_owned()));
        assert_eq!(filename_extension("noext"), None);
        assert!(is_inline_media_type("text/csv"));
        assert!(!is_inline_media_type(DEFAULT_MEDIA_TYPE));
    }
}
