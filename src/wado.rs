//! WADO-RS download path for the C-MOVE pipeline. Instances arrive as
//! `multipart/related` bodies, zip archives or bare `application/dicom`
//! payloads; every blob must satisfy the Part-10 contract before it is
//! cached or forwarded.

use bytes::Bytes;
use dicom::object::{FileDicomObject, InMemDicomObject};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

const ACCEPT_DICOM_MULTIPART: &str = "multipart/related; type=\"application/dicom\"";

const PREAMBLE_LENGTH: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
/// Preamble plus magic marker; no Part-10 stream can be shorter.
pub const MIN_PART10_LENGTH: usize = PREAMBLE_LENGTH + MAGIC.len();

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error("Upstream returned HTTP {status} for {url}")]
	Upstream { status: u16, url: String },
	#[error("Failed to reach upstream: {0}")]
	Http(#[from] reqwest::Error),
	#[error("Unreadable multipart body: {0}")]
	Multipart(#[from] multer::Error),
	#[error("Unreadable zip body: {0}")]
	Zip(#[from] zip::result::ZipError),
	#[error("Blob is not a Part-10 DICOM stream (no magic marker at offset 128)")]
	Part10,
	#[error("Response contained no DICOM payload")]
	EmptyResponse,
	#[error("Failed to decode DICOM stream: {0}")]
	Decode(#[from] dicom::object::ReadError),
	#[error("Presentation context rejected for SOP class {sop_class_uid}")]
	PresentationContextRejected { sop_class_uid: String },
	#[error("Timed out waiting for {0}")]
	Timeout(&'static str),
}

/// Checks the Part-10 contract: 128 preamble bytes, then `DICM`.
pub fn ensure_part10(blob: &[u8]) -> Result<(), RetrieveError> {
	let valid = blob.len() >= MIN_PART10_LENGTH
		&& &blob[PREAMBLE_LENGTH..MIN_PART10_LENGTH] == MAGIC;
	valid.then_some(()).ok_or(RetrieveError::Part10)
}

/// Decodes a Part-10 blob into a file object carrying its File Meta
/// Information. The caller is expected to have run [`ensure_part10`].
pub fn decode_instance(blob: &[u8]) -> Result<FileDicomObject<InMemDicomObject>, RetrieveError> {
	ensure_part10(blob)?;
	Ok(dicom::object::from_reader(&blob[PREAMBLE_LENGTH..])?)
}

pub struct WadoClient {
	http: reqwest::Client,
}

impl WadoClient {
	/// # Errors
	/// Returns [`RetrieveError::Http`] if the underlying client cannot be built.
	pub fn new(read_timeout: Duration) -> Result<Self, RetrieveError> {
		let http = reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(10))
			.timeout(read_timeout)
			.build()?;
		Ok(Self { http })
	}

	/// Downloads one instance URL and splits the response into Part-10 blobs.
	#[instrument(skip(self))]
	pub async fn retrieve(&self, url: &str) -> Result<Vec<Bytes>, RetrieveError> {
		let response = self
			.http
			.get(url)
			.header(ACCEPT, ACCEPT_DICOM_MULTIPART)
			.send()
			.await?;

		if response.status() != StatusCode::OK {
			return Err(RetrieveError::Upstream {
				status: response.status().as_u16(),
				url: String::from(url),
			});
		}

		let content_type = response
			.headers()
			.get(CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.map(str::to_owned);
		let body = response.bytes().await?;

		let blobs = split_response(content_type.as_deref(), body).await?;
		debug!(count = blobs.len(), "Retrieved DICOM blobs");

		for blob in &blobs {
			ensure_part10(blob)?;
		}
		Ok(blobs)
	}
}

/// Splits a WADO-RS response body into individual DICOM blobs based on its
/// Content-Type. Unlabelled bodies are treated as a single blob.
async fn split_response(
	content_type: Option<&str>,
	body: Bytes,
) -> Result<Vec<Bytes>, RetrieveError> {
	let Some(mime) = content_type.and_then(|value| value.parse::<mime::Mime>().ok()) else {
		return Ok(vec![body]);
	};

	if mime.type_() == mime::MULTIPART && mime.subtype().as_str() == "related" {
		let boundary = mime
			.get_param(mime::BOUNDARY)
			.map(|name| name.as_str().to_owned())
			.ok_or(multer::Error::NoBoundary)?;
		return parse_multipart(body, &boundary).await;
	}

	if mime.subtype().as_str() == "zip" {
		return unzip_blobs(&body);
	}

	Ok(vec![body])
}

/// The `multer` crate expects multipart/form-data, but accepts any boundary
/// we hand it; the body is replayed as a one-element stream.
async fn parse_multipart(body: Bytes, boundary: &str) -> Result<Vec<Bytes>, RetrieveError> {
	let stream = futures::stream::iter([Ok::<Bytes, std::io::Error>(body)]);
	let mut multipart = multer::Multipart::new(stream, boundary);

	let mut blobs = Vec::new();
	while let Some(field) = multipart.next_field().await? {
		blobs.push(field.bytes().await?);
	}
	Ok(blobs)
}

/// One DICOM blob per zip entry; directories are skipped.
fn unzip_blobs(body: &[u8]) -> Result<Vec<Bytes>, RetrieveError> {
	let mut archive = zip::ZipArchive::new(std::io::Cursor::new(body))?;
	let mut blobs = Vec::new();
	for index in 0..archive.len() {
		let mut entry = archive.by_index(index)?;
		if entry.is_dir() {
			continue;
		}
		let mut blob = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
		entry
			.read_to_end(&mut blob)
			.map_err(|err| RetrieveError::Zip(zip::result::ZipError::Io(err)))?;
		blobs.push(Bytes::from(blob));
	}
	Ok(blobs)
}
