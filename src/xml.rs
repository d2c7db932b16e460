//! S3 XML payloads.
//!
//! Responses are rendered with the `quick-xml` event writer into a complete
//! in-memory document before anything is sent. The one request body the
//! server understands, `<Delete>`, is deserialized through `quick-xml`'s
//! serde support.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Deserialize;

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Wrap a rendered document in a `200 OK` with the XML content type.
pub fn xml_ok(body: String) -> Response {
    (StatusCode::OK, [("content-type", "application/xml")], body).into_response()
}

// ── Document builder ────────────────────────────────────────────────

/// Thin wrapper over `quick_xml::Writer` writing into memory.
///
/// Writes into a `Vec<u8>` cannot fail, hence the `expect`s.
struct XmlDoc {
    writer: Writer<Vec<u8>>,
}

impl XmlDoc {
    fn new() -> Self {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .expect("xml decl");
        Self { writer }
    }

    fn open_root(&mut self, tag: &str) {
        let root = BytesStart::new(tag).with_attributes([("xmlns", S3_NAMESPACE)]);
        self.writer.write_event(Event::Start(root)).expect("start root");
    }

    fn empty_root(&mut self, tag: &str) {
        let root = BytesStart::new(tag).with_attributes([("xmlns", S3_NAMESPACE)]);
        self.writer.write_event(Event::Empty(root)).expect("empty root");
    }

    fn open(&mut self, tag: &str) {
        self.writer
            .write_event(Event::Start(BytesStart::new(tag)))
            .expect("start tag");
    }

    fn close(&mut self, tag: &str) {
        self.writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .expect("end tag");
    }

    /// `<tag>text</tag>`, text escaped.
    fn text(&mut self, tag: &str, text: &str) {
        self.open(tag);
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .expect("text");
        self.close(tag);
    }

    /// A parent element holding a flat list of text children.
    fn group(&mut self, parent: &str, children: &[(&str, &str)]) {
        self.open(parent);
        for (tag, value) in children {
            self.text(tag, value);
        }
        self.close(parent);
    }

    fn finish(self) -> String {
        String::from_utf8(self.writer.into_inner()).expect("valid utf-8")
    }
}

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchBucket</Code>
///   <Message>The specified bucket does not exist</Message>
///   <Resource>mybucket</Resource>
///   <RequestId>4442587FB7D0A2F9</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    doc.finish()
}

// ── ListAllMyBucketsResult ──────────────────────────────────────────

/// One bucket in a `ListAllMyBucketsResult`.
pub struct BucketEntry {
    pub name: String,
    pub creation_date: String,
}

/// Render the `<ListAllMyBucketsResult>` response for `GET /`.
pub fn render_list_buckets_result(owner: &Owner<'_>, buckets: &[BucketEntry]) -> String {
    let mut doc = XmlDoc::new();
    doc.open_root("ListAllMyBucketsResult");
    doc.group("Owner", &[("ID", owner.id), ("DisplayName", owner.display_name)]);
    doc.open("Buckets");
    for bucket in buckets {
        doc.group(
            "Bucket",
            &[("Name", &bucket.name), ("CreationDate", &bucket.creation_date)],
        );
    }
    doc.close("Buckets");
    doc.close("ListAllMyBucketsResult");
    doc.finish()
}

/// Owner block shared by bucket and version listings.
pub struct Owner<'a> {
    pub id: &'a str,
    pub display_name: &'a str,
}

// ── ListBucketResult ────────────────────────────────────────────────

/// A file (or folder placeholder) in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub last_modified: String,
    pub etag: String,
    pub size: u64,
}

/// Everything needed to render one `<ListBucketResult>`.
pub struct ListObjectsPage<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub delimiter: Option<&'a str>,
    pub max_keys: usize,
    pub contents: &'a [ObjectEntry],
    pub common_prefixes: &'a [String],
}

/// Render `<ListBucketResult>`. Listings are never truncated.
pub fn render_list_objects_result(page: &ListObjectsPage<'_>) -> String {
    let mut doc = XmlDoc::new();
    doc.open_root("ListBucketResult");
    doc.text("Name", page.bucket);
    doc.text("Prefix", page.prefix);
    if let Some(delimiter) = page.delimiter {
        doc.text("Delimiter", delimiter);
    }
    doc.text("MaxKeys", &page.max_keys.to_string());
    doc.text(
        "KeyCount",
        &(page.contents.len() + page.common_prefixes.len()).to_string(),
    );
    doc.text("IsTruncated", "false");

    for entry in page.contents {
        doc.open("Contents");
        doc.text("Key", &entry.key);
        doc.text("LastModified", &entry.last_modified);
        doc.text("ETag", &entry.etag);
        doc.text("Size", &entry.size.to_string());
        doc.text("StorageClass", "STANDARD");
        doc.close("Contents");
    }

    for prefix in page.common_prefixes {
        doc.group("CommonPrefixes", &[("Prefix", prefix)]);
    }

    doc.close("ListBucketResult");
    doc.finish()
}

// ── ListVersionsResult ──────────────────────────────────────────────

/// Render `<ListVersionsResult>`; every file is its own only, latest
/// version with id `null`.
pub fn render_list_versions_result(
    bucket: &str,
    prefix: &str,
    owner: &Owner<'_>,
    versions: &[ObjectEntry],
) -> String {
    let mut doc = XmlDoc::new();
    doc.open_root("ListVersionsResult");
    doc.text("Name", bucket);
    doc.text("Prefix", prefix);
    doc.text("KeyMarker", "");
    doc.text("VersionIdMarker", "");
    doc.text("MaxKeys", "1000");
    doc.text("IsTruncated", "false");

    for version in versions {
        doc.open("Version");
        doc.text("Key", &version.key);
        doc.text("VersionId", "null");
        doc.text("IsLatest", "true");
        doc.text("LastModified", &version.last_modified);
        doc.text("ETag", &version.etag);
        doc.text("Size", &version.size.to_string());
        doc.group("Owner", &[("ID", owner.id), ("DisplayName", owner.display_name)]);
        doc.text("StorageClass", "STANDARD");
        doc.close("Version");
    }

    doc.close("ListVersionsResult");
    doc.finish()
}

// ── VersioningConfiguration ─────────────────────────────────────────

/// Render the `<VersioningConfiguration/>` of a bucket that never had
/// versioning enabled.
pub fn render_versioning_configuration() -> String {
    let mut doc = XmlDoc::new();
    doc.empty_root("VersioningConfiguration");
    doc.finish()
}

// ── DeleteResult ────────────────────────────────────────────────────

/// Represents a single error in a DeleteObjects response.
pub struct DeleteErrorEntry {
    pub key: String,
    pub code: &'static str,
    pub message: String,
}

/// Render `<DeleteResult>` for batch DeleteObjects.
pub fn render_delete_result(
    deleted: &[String],
    errors: &[DeleteErrorEntry],
    quiet: bool,
) -> String {
    let mut doc = XmlDoc::new();
    doc.open_root("DeleteResult");

    if !quiet {
        for key in deleted {
            doc.group("Deleted", &[("Key", key)]);
        }
    }

    for entry in errors {
        doc.group(
            "Error",
            &[
                ("Key", &entry.key),
                ("Code", entry.code),
                ("Message", &entry.message),
            ],
        );
    }

    doc.close("DeleteResult");
    doc.finish()
}

// ── CopyObjectResult ────────────────────────────────────────────────

/// Render `<CopyObjectResult>` returned by `PUT` with `x-amz-copy-source`.
pub fn render_copy_object_result(etag: &str, last_modified: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "CopyObjectResult",
        &[("ETag", etag), ("LastModified", last_modified)],
    );
    doc.finish()
}

// ── InitiateMultipartUploadResult ───────────────────────────────────

/// Render `<InitiateMultipartUploadResult>`.
pub fn render_initiate_multipart_upload_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.open_root("InitiateMultipartUploadResult");
    doc.text("Bucket", bucket);
    doc.text("Key", key);
    doc.text("UploadId", upload_id);
    doc.close("InitiateMultipartUploadResult");
    doc.finish()
}

// ── Delete request body ─────────────────────────────────────────────

/// Parsed `<Delete>` request body of a batch delete.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteRequest {
    #[serde(default)]
    pub quiet: bool,
    #[serde(rename = "Object", default)]
    pub objects: Vec<ObjectIdentifier>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectIdentifier {
    pub key: String,
    #[serde(default)]
    pub version_id: Option<String>,
}

/// Deserialize a `<Delete>` body.
pub fn parse_delete_request(body: &[u8]) -> Result<DeleteRequest, quick_xml::DeError> {
    let text = std::str::from_utf8(body).map_err(|e| quick_xml::DeError::Custom(e.to_string()))?;
    quick_xml::de::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_escapes_text() {
        let xml = render_error("NoSuchKey", "gone", "a<b>&c", "ABCDEF0123456789");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Resource>a&lt;b&gt;&amp;c</Resource>"));
        assert!(xml.contains("<RequestId>ABCDEF0123456789</RequestId>"));
    }

    #[test]
    fn test_render_list_buckets() {
        let owner = Owner { id: "user", display_name: "user" };
        let buckets = vec![BucketEntry {
            name: "photos".into(),
            creation_date: "2024-01-01T00:00:00.000Z".into(),
        }];
        let xml = render_list_buckets_result(&owner, &buckets);
        assert!(xml.contains(
            "<ListAllMyBucketsResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">"
        ));
        assert!(xml.contains("<Owner><ID>user</ID><DisplayName>user</DisplayName></Owner>"));
        assert!(xml.contains(
            "<Bucket><Name>photos</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate></Bucket>"
        ));
    }

    #[test]
    fn test_render_list_objects_with_common_prefixes() {
        let contents = vec![ObjectEntry {
            key: "docs/readme.md".into(),
            last_modified: "2024-01-01T00:00:00.000Z".into(),
            etag: "\"abc\"".into(),
            size: 12,
        }];
        let prefixes = vec!["docs/img/".to_string()];
        let xml = render_list_objects_result(&ListObjectsPage {
            bucket: "b",
            prefix: "docs/",
            delimiter: Some("/"),
            max_keys: 1000,
            contents: &contents,
            common_prefixes: &prefixes,
        });
        assert!(xml.contains("<Delimiter>/</Delimiter>"));
        assert!(xml.contains("<KeyCount>2</KeyCount>"));
        assert!(xml.contains("<Key>docs/readme.md</Key>"));
        assert!(xml.contains("<ETag>&quot;abc&quot;</ETag>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>docs/img/</Prefix></CommonPrefixes>"));
    }

    #[test]
    fn test_render_list_objects_without_delimiter_omits_element() {
        let xml = render_list_objects_result(&ListObjectsPage {
            bucket: "b",
            prefix: "",
            delimiter: None,
            max_keys: 1000,
            contents: &[],
            common_prefixes: &[],
        });
        assert!(!xml.contains("<Delimiter>"));
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
    }

    #[test]
    fn test_render_versioning_is_empty() {
        let xml = render_versioning_configuration();
        assert!(xml.ends_with(
            "<VersioningConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"/>"
        ));
    }

    #[test]
    fn test_render_delete_result_quiet_hides_deleted() {
        let deleted = vec!["a.txt".to_string()];
        let errors = vec![DeleteErrorEntry {
            key: "b.txt".into(),
            code: "NoSuchKey",
            message: "The resource you requested does not exist".into(),
        }];
        let loud = render_delete_result(&deleted, &errors, false);
        assert!(loud.contains("<Deleted><Key>a.txt</Key></Deleted>"));
        assert!(loud.contains("<Code>NoSuchKey</Code>"));

        let quiet = render_delete_result(&deleted, &errors, true);
        assert!(!quiet.contains("<Deleted>"));
        assert!(quiet.contains("<Key>b.txt</Key>"));
    }

    #[test]
    fn test_render_initiate_multipart() {
        let xml = render_initiate_multipart_upload_result("b", "big.bin", "u-1");
        assert!(xml.contains("<Bucket>b</Bucket><Key>big.bin</Key><UploadId>u-1</UploadId>"));
    }

    #[test]
    fn test_parse_delete_request() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<Delete xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Quiet>true</Quiet>
  <Object><Key>a.txt</Key></Object>
  <Object><Key>dir/b.txt</Key><VersionId>null</VersionId></Object>
</Delete>"#;
        let req = parse_delete_request(body).unwrap();
        assert!(req.quiet);
        assert_eq!(req.objects.len(), 2);
        assert_eq!(req.objects[0].key, "a.txt");
        assert_eq!(req.objects[1].key, "dir/b.txt");
        assert_eq!(req.objects[1].version_id.as_deref(), Some("null"));
    }

    #[test]
    fn test_parse_delete_request_defaults() {
        let req = parse_delete_request(b"<Delete><Object><Key>k</Key></Object></Delete>").unwrap();
        assert!(!req.quiet);
        assert_eq!(req.objects.len(), 1);
    }

    #[test]
    fn test_parse_delete_request_malformed() {
        assert!(parse_delete_request(b"<Delete><Object><Key>k</Object>").is_err());
        assert!(parse_delete_request(b"").is_err());
    }
}
