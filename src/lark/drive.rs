//! Drive media: uploads into a Bitable attachment slot and downloads by token.

use crate::error::{LarkError, Result};
use crate::lark::bitable::{BitableClient, Record};
use crate::lark::client::{Download, LarkClient};
use crate::multipart::{self, Attachment, MultipartMessage, Part};

/// Lark rejects media uploads above 20MB.
pub const LARK_MAX_FILE_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Bitable attachments live under this parent type.
pub const BITABLE_PARENT_TYPE: &str = "bitable_file";

const FALLBACK_FILE_NAME: &str = "file";

/// A named file and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBody {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// One file headed for `drive/v1/medias/upload_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: String,
    pub parent_type: String,
    pub parent_node: String,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    /// Upload targeting the attachment storage of a Bitable app.
    pub fn for_bitable(
        app_token: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            parent_type: BITABLE_PARENT_TYPE.to_string(),
            parent_node: app_token.into(),
            bytes,
        }
    }

    /// The form expected by `upload_all`; `size` always matches the file part.
    pub fn to_message(&self) -> MultipartMessage {
        MultipartMessage::new()
            .with(Part::text("file_name", self.file_name.as_str()))
            .with(Part::text("parent_type", self.parent_type.as_str()))
            .with(Part::text("parent_node", self.parent_node.as_str()))
            .with(Part::text("size", self.bytes.len().to_string()))
            .with(Part::file(
                "file",
                self.file_name.as_str(),
                self.content_type.as_str(),
                self.bytes.clone(),
            ))
    }
}

/// An inbound upload request: where the file goes and the file itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadForm {
    pub file: FileBody,
    pub app_token: Option<String>,
    pub table_id: Option<String>,
    pub record_id: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl UploadForm {
    /// Pull the attachment and routing fields out of a decoded form.
    ///
    /// The `file_name` field overrides the attachment's own filename.
    pub fn from_message(message: &MultipartMessage, max_bytes: usize) -> Result<Self> {
        let Attachment {
            filename,
            content_type,
            bytes,
            ..
        } = message.require_attachment()?;
        if bytes.len() > max_bytes {
            return Err(LarkError::PayloadTooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let file_name = non_empty(message.text("file_name"))
            .or_else(|| non_empty(Some(filename)))
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

        Ok(Self {
            file: FileBody {
                file_name,
                content_type: content_type.to_string(),
                bytes: bytes.to_vec(),
            },
            app_token: non_empty(message.text("app_token")),
            table_id: non_empty(message.text("table_id")),
            record_id: non_empty(message.text("record_id")),
        })
    }

    /// Decode a raw request body and extract the upload.
    pub fn parse(body: &[u8], content_type: &str, max_bytes: usize) -> Result<Self> {
        let message = multipart::decode_with_content_type(body, content_type)?;
        Self::from_message(&message, max_bytes)
    }
}

/// Where an inbound upload is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub app_token: String,
    pub table_id: String,
    pub record_id: String,
}

impl UploadForm {
    /// Resolve the destination. Explicit values win over the form's own
    /// fields; the app token finally falls back to `default_app_token`.
    pub fn target(
        &self,
        app_token: Option<&str>,
        table_id: Option<&str>,
        record_id: Option<&str>,
        default_app_token: &str,
    ) -> Result<UploadTarget> {
        let pick = |explicit: Option<&str>, from_form: &Option<String>| {
            non_empty(explicit).or_else(|| from_form.clone())
        };
        Ok(UploadTarget {
            app_token: pick(app_token, &self.app_token)
                .or_else(|| non_empty(Some(default_app_token)))
                .ok_or(LarkError::IncompleteUpload("app_token"))?,
            table_id: pick(table_id, &self.table_id)
                .ok_or(LarkError::IncompleteUpload("table_id"))?,
            record_id: pick(record_id, &self.record_id)
                .ok_or(LarkError::IncompleteUpload("record_id"))?,
        })
    }
}

/// Drive media operations.
#[derive(Clone)]
pub struct DriveClient {
    client: LarkClient,
    max_upload_bytes: usize,
}

impl DriveClient {
    pub fn new(client: LarkClient) -> Self {
        Self {
            client,
            max_upload_bytes: LARK_MAX_FILE_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Upload a file and return its `file_token`.
    pub async fn upload_media(&self, upload: &MediaUpload) -> Result<String> {
        if upload.bytes.len() > self.max_upload_bytes {
            return Err(LarkError::PayloadTooLarge {
                size: upload.bytes.len(),
                limit: self.max_upload_bytes,
            });
        }

        let encoded = multipart::encode(&upload.to_message());
        let resp = self
            .client
            .post_raw(
                "upload media",
                "/drive/v1/medias/upload_all",
                &encoded.content_type(),
                &encoded.body,
            )
            .await?;

        let token = resp
            .pointer("/data/file_token")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LarkError::unexpected("upload media", "missing data.file_token"))?;
        tracing::info!(
            file_name = %upload.file_name,
            size = upload.bytes.len(),
            "uploaded media"
        );
        Ok(token.to_string())
    }

    /// Download a media file by token.
    pub async fn download_media(&self, file_token: &str) -> Result<Download> {
        let path = format!(
            "/drive/v1/medias/{}/download",
            urlencoding::encode(file_token)
        );
        self.client.get_bytes("download media", &path).await
    }

    /// Upload into the Bitable app and point `field` of the record at the new file.
    pub async fn attach_to_record(
        &self,
        bitable: &BitableClient,
        table_id: &str,
        record_id: &str,
        field: &str,
        file: FileBody,
    ) -> Result<(String, Record)> {
        let upload = MediaUpload::for_bitable(
            bitable.app_token(),
            file.file_name,
            file.content_type,
            file.bytes,
        );
        let file_token = self.upload_media(&upload).await?;

        let mut fields = serde_json::Map::new();
        fields.insert(
            field.to_string(),
            serde_json::json!([{ "file_token": file_token }]),
        );
        let record = bitable.update_record(table_id, record_id, fields).await?;
        Ok((file_token, record))
    }

    /// Attach the file of a decoded upload form to its target record.
    pub async fn attach_form(
        &self,
        form: UploadForm,
        target: &UploadTarget,
        field: &str,
    ) -> Result<(String, Record)> {
        let bitable = BitableClient::new(self.client.clone(), target.app_token.as_str());
        tracing::debug!(
            app_token = %target.app_token,
            table_id = %target.table_id,
            record_id = %target.record_id,
            "attaching uploaded form"
        );
        self.attach_to_record(&bitable, &target.table_id, &target.record_id, field, form.file)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lark::client::test_support::client_for;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn body_of(request: &Request) -> MultipartMessage {
        let content_type = request
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        multipart::decode_with_content_type(&request.body, &content_type).unwrap()
    }

    #[test]
    fn media_upload_form_carries_size_of_file() {
        let upload = MediaUpload::for_bitable("bascnAPP", "a.txt", "text/plain", b"hello".to_vec());
        let message = upload.to_message();
        assert_eq!(message.text("parent_type"), Some("bitable_file"));
        assert_eq!(message.text("parent_node"), Some("bascnAPP"));
        assert_eq!(message.text("size"), Some("5"));
        assert_eq!(message.attachment().unwrap().bytes, b"hello");
    }

    #[test]
    fn upload_form_prefers_explicit_file_name() {
        let message = MultipartMessage::new()
            .with(Part::text("file_name", "报告.pdf"))
            .with(Part::text("record_id", "recX"))
            .with(Part::text("table_id", " "))
            .with(Part::file("file", "blob", "application/pdf", b"%PDF".to_vec()));
        let form = UploadForm::from_message(&message, 1024).unwrap();
        assert_eq!(form.file.file_name, "报告.pdf");
        assert_eq!(form.record_id.as_deref(), Some("recX"));
        assert_eq!(form.table_id, None);
        assert_eq!(form.file.bytes, b"%PDF");
    }

    #[test]
    fn upload_form_rejects_oversized_attachment() {
        let message = MultipartMessage::new().with(Part::file(
            "file",
            "big.bin",
            "application/octet-stream",
            vec![0u8; 11],
        ));
        let err = UploadForm::from_message(&message, 10).unwrap_err();
        assert!(matches!(
            err,
            LarkError::PayloadTooLarge {
                size: 11,
                limit: 10
            }
        ));
    }

    #[test]
    fn upload_form_without_file_is_missing_upload() {
        let message = MultipartMessage::new().with(Part::text("file_name", "x"));
        assert!(matches!(
            UploadForm::from_message(&message, 10),
            Err(LarkError::MissingUpload)
        ));
    }

    const BROWSER_FORM: &[u8] = b"------WebKitFormBoundaryQ7\r\n\
Content-Disposition: form-data; name=\"table_id\"\r\n\r\n\
tblForm\r\n\
------WebKitFormBoundaryQ7\r\n\
Content-Disposition: form-data; name=\"record_id\"\r\n\r\n\
recForm\r\n\
------WebKitFormBoundaryQ7\r\n\
Content-Disposition: form-data; name=\"file_name\"\r\n\r\n\
weekly \"final\".pdf\r\n\
------WebKitFormBoundaryQ7\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\
Content-Type: application/pdf\r\n\r\n\
%PDF\x00\xff\r\n\
------WebKitFormBoundaryQ7--\r\n";
    const BROWSER_CONTENT_TYPE: &str =
        "multipart/form-data; boundary=----WebKitFormBoundaryQ7";

    #[test]
    fn upload_target_prefers_explicit_then_form_then_default() {
        let form = UploadForm::parse(BROWSER_FORM, BROWSER_CONTENT_TYPE, 1024).unwrap();
        assert_eq!(form.file.file_name, "weekly \"final\".pdf");
        assert_eq!(form.file.bytes, b"%PDF\x00\xff");

        let target = form.target(None, None, None, "bascnDEFAULT").unwrap();
        assert_eq!(
            target,
            UploadTarget {
                app_token: "bascnDEFAULT".into(),
                table_id: "tblForm".into(),
                record_id: "recForm".into(),
            }
        );

        let target = form
            .target(Some("bascnCLI"), Some("tblCLI"), Some(""), "bascnDEFAULT")
            .unwrap();
        assert_eq!(target.app_token, "bascnCLI");
        assert_eq!(target.table_id, "tblCLI");
        assert_eq!(target.record_id, "recForm");
    }

    #[test]
    fn upload_target_without_record_is_incomplete() {
        let message = MultipartMessage::new()
            .with(Part::text("table_id", "tblT"))
            .with(Part::file("file", "a.txt", "text/plain", b"a".to_vec()));
        let form = UploadForm::from_message(&message, 1024).unwrap();
        assert!(matches!(
            form.target(None, None, None, "bascnAPP"),
            Err(LarkError::IncompleteUpload("record_id"))
        ));
        assert!(matches!(
            form.target(None, None, Some("recR"), ""),
            Err(LarkError::IncompleteUpload("app_token"))
        ));
    }

    #[test]
    fn oversized_raw_form_is_rejected_before_upload() {
        assert!(matches!(
            UploadForm::parse(BROWSER_FORM, BROWSER_CONTENT_TYPE, 5),
            Err(LarkError::PayloadTooLarge { size: 6, limit: 5 })
        ));
    }

    #[tokio::test]
    async fn raw_form_is_uploaded_and_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drive/v1/medias/upload_all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "file_token": "boxcnFORM" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bitable/v1/apps/bascnDEFAULT/tables/tblForm/records/recForm"))
            .and(body_json(serde_json::json!({
                "fields": { "输出文件": [{ "file_token": "boxcnFORM" }] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "record": { "record_id": "recForm", "fields": {} } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let drive = DriveClient::new(client_for(&server.uri()));
        let form =
            UploadForm::parse(BROWSER_FORM, BROWSER_CONTENT_TYPE, drive.max_upload_bytes()).unwrap();
        let target = form.target(None, None, None, "bascnDEFAULT").unwrap();
        let (token, record) = drive.attach_form(form, &target, "输出文件").await.unwrap();
        assert_eq!(token, "boxcnFORM");
        assert_eq!(record.record_id, "recForm");

        let requests = server.received_requests().await.unwrap();
        let sent = body_of(&requests[0]);
        assert_eq!(sent.text("file_name"), Some("weekly \"final\".pdf"));
        assert_eq!(sent.text("parent_node"), Some("bascnDEFAULT"));
        assert_eq!(sent.text("size"), Some("6"));
        let attachment = sent.attachment().unwrap();
        assert_eq!(attachment.filename, "weekly \"final\".pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.bytes, b"%PDF\x00\xff");
    }

    #[tokio::test]
    async fn upload_media_posts_multipart_and_returns_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drive/v1/medias/upload_all"))
            .and(header("authorization", "Bearer t-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "file_token": "boxcnFILE" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let drive = DriveClient::new(client_for(&server.uri()));
        let upload = MediaUpload::for_bitable(
            "bascnAPP",
            "r.bin",
            "application/octet-stream",
            vec![0, 1, 2, 0xff],
        );
        let token = drive.upload_media(&upload).await.unwrap();
        assert_eq!(token, "boxcnFILE");

        let requests = server.received_requests().await.unwrap();
        let sent = body_of(&requests[0]);
        assert_eq!(sent.text("size"), Some("4"));
        assert_eq!(sent.attachment().unwrap().bytes, &[0, 1, 2, 0xff]);
    }

    #[tokio::test]
    async fn oversized_upload_never_reaches_the_wire() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let drive = DriveClient::new(client_for(&server.uri())).with_max_upload_bytes(3);
        let upload =
            MediaUpload::for_bitable("bascnAPP", "r.bin", "application/octet-stream", vec![0; 4]);
        assert!(matches!(
            drive.upload_media(&upload).await,
            Err(LarkError::PayloadTooLarge { size: 4, limit: 3 })
        ));
    }

    #[tokio::test]
    async fn attach_to_record_links_uploaded_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drive/v1/medias/upload_all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "file_token": "boxcnFILE" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bitable/v1/apps/bascnAPP/tables/tblT/records/recR"))
            .and(body_json(serde_json::json!({
                "fields": { "输出文件": [{ "file_token": "boxcnFILE" }] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "record": { "record_id": "recR", "fields": {} } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let bitable = BitableClient::new(client.clone(), "bascnAPP");
        let drive = DriveClient::new(client);
        let (token, record) = drive
            .attach_to_record(
                &bitable,
                "tblT",
                "recR",
                "输出文件",
                FileBody {
                    file_name: "out.txt".into(),
                    content_type: "text/plain".into(),
                    bytes: b"ok".to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(token, "boxcnFILE");
        assert_eq!(record.record_id, "recR");
    }

    #[tokio::test]
    async fn download_returns_bytes_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v1/medias/boxcnFILE/download"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0x89, 0x50, 0x4e, 0x47]),
            )
            .mount(&server)
            .await;

        let drive = DriveClient::new(client_for(&server.uri()));
        let download = drive.download_media("boxcnFILE").await.unwrap();
        assert_eq!(download.content_type, "image/png");
        assert_eq!(download.bytes, vec![0x89, 0x50, 0x4e, 0x47]);
    }
}
