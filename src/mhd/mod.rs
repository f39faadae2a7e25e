//! HTTP client for the MHD endpoint backing this gateway:
//! - DocumentReference search (ITI-67) drives study-level C-FIND.
//! - Manifest retrieval (ITI-68) feeds the metadata cache.

mod client;
pub mod fhir;

pub use client::MhdClient;

use crate::types::UI;
use bytes::Bytes;
use fhir::DocumentReferenceResource;
use thiserror::Error;

/// Sentinel author display emitted by some document sources when the
/// referring physician is unknown. Never projected.
const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// Search keys for a study-level query. Empty fields are omitted from the
/// upstream request.
#[derive(Debug, Clone, Default)]
pub struct StudyQuery {
	pub patient_id: Option<String>,
	pub accession_number: Option<String>,
	pub study_instance_uid: Option<UI>,
	pub modality: Option<String>,
	/// DICOM `YYYYMMDD` form.
	pub date_from: Option<String>,
	/// DICOM `YYYYMMDD` form.
	pub date_to: Option<String>,
}

/// A DocumentReference reduced to the study attributes this gateway serves.
#[derive(Debug, Clone, Default)]
pub struct DocumentReference {
	pub study_instance_uid: UI,
	pub accession_number: Option<String>,
	pub patient_id: Option<String>,
	pub patient_name: Option<String>,
	pub study_date: Option<String>,
	pub study_time: Option<String>,
	pub modalities_in_study: Vec<String>,
	pub referring_physician_name: Option<String>,
	pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum MhdError {
	#[error("Upstream returned HTTP {status} for {url}")]
	Upstream { status: u16, url: String },
	#[error("Failed to reach upstream: {0}")]
	Http(#[from] reqwest::Error),
	#[error("Malformed FHIR payload: {0}")]
	Payload(#[from] serde_json::Error),
	#[error("Invalid upstream URL: {0}")]
	Url(#[from] url::ParseError),
}

/// Seam between the metadata layer and the MHD endpoint. The production
/// implementation is [`MhdClient`]; tests substitute mocks.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
	async fn search_document_references(
		&self,
		query: &StudyQuery,
	) -> Result<Vec<DocumentReference>, MhdError>;

	/// `Ok(None)` when the upstream has no manifest for this study (HTTP 404).
	async fn retrieve_manifest(&self, study_instance_uid: &str)
		-> Result<Option<Bytes>, MhdError>;
}

/// Strips the `urn:oid:` prefix FHIR uses for DICOM UIDs.
fn strip_oid_prefix(value: &str) -> &str {
	value.strip_prefix("urn:oid:").unwrap_or(value)
}

/// Projects a FHIR DocumentReference onto the gateway's study attributes.
/// Returns `None` when no Study Instance UID can be recovered.
pub fn project_document_reference(
	resource: &DocumentReferenceResource,
) -> Option<DocumentReference> {
	let study_instance_uid = resource
		.master_identifier
		.as_ref()
		.and_then(|identifier| identifier.value.as_deref())
		.map(strip_oid_prefix)
		.filter(|uid| !uid.is_empty())?
		.to_owned();

	let accession_number = resource
		.context
		.as_ref()
		.and_then(|context| {
			context
				.related
				.iter()
				.find_map(|related| related.identifier.as_ref()?.value.clone())
		})
		.or_else(|| {
			resource.identifier.iter().find_map(|identifier| {
				identifier
					.system
					.as_deref()
					.is_some_and(|system| system.contains("accession"))
					.then(|| identifier.value.clone())
					.flatten()
			})
		});

	let (patient_id, patient_name) = resource.subject.as_ref().map_or((None, None), |subject| {
		let id = subject
			.identifier
			.as_ref()
			.and_then(|identifier| identifier.value.clone());
		(id, subject.display.clone())
	});

	let (study_date, study_time) = resource
		.date
		.as_deref()
		.map_or((None, None), split_fhir_instant);

	let mut modalities_in_study = Vec::new();
	if let Some(context) = &resource.context {
		for event in &context.event {
			for coding in &event.coding {
				if let Some(code) = &coding.code {
					if !modalities_in_study.iter().any(|known| known == code) {
						modalities_in_study.push(code.clone());
					}
				}
			}
		}
	}

	let referring_physician_name = resource
		.author
		.iter()
		.find_map(|author| author.display.clone())
		.filter(|display| display != UNKNOWN_AUTHOR);

	Some(DocumentReference {
		study_instance_uid,
		accession_number,
		patient_id,
		patient_name,
		study_date,
		study_time,
		modalities_in_study,
		referring_physician_name,
		description: resource.description.clone(),
	})
}

/// Splits a FHIR instant (`2024-05-01T10:30:00Z`) into DICOM DA/TM values.
fn split_fhir_instant(instant: &str) -> (Option<String>, Option<String>) {
	let (date_part, time_part) = match instant.split_once('T') {
		Some((date, time)) => (date, Some(time)),
		None => (instant, None),
	};

	let date: String = date_part.chars().filter(char::is_ascii_digit).collect();
	let date = (date.len() == 8).then_some(date);

	let time = time_part.and_then(|time| {
		let digits: String = time
			.chars()
			.take_while(|c| *c != 'Z' && *c != '+' && *c != '-')
			.filter(char::is_ascii_digit)
			.collect();
		(digits.len() >= 6).then(|| digits[..6].to_owned())
	});

	(date, time)
}

/// Translates a DICOM `YYYYMMDD` date into the FHIR `YYYY-MM-DD` form.
/// Values not in `YYYYMMDD` form pass through unchanged.
pub fn dicom_date_to_fhir(date: &str) -> String {
	if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) {
		format!("{}-{}-{}", &date[..4], &date[4..6], &date[6..8])
	} else {
		date.to_owned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn resource_from_json(json: serde_json::Value) -> DocumentReferenceResource {
		serde_json::from_value(json).unwrap()
	}

	#[test]
	fn projects_core_attributes() {
		let resource = resource_from_json(serde_json::json!({
			"resourceType": "DocumentReference",
			"masterIdentifier": { "value": "urn:oid:1.2.3.4.5.6.7.8.2" },
			"subject": {
				"display": "DOE^JANE",
				"identifier": { "value": "PAT-001" }
			},
			"date": "2024-05-01T10:30:00Z",
			"author": [{ "display": "Dr. House" }],
			"description": "CT Abdomen",
			"context": {
				"event": [
					{ "coding": [{ "code": "CT" }] },
					{ "coding": [{ "code": "MR" }, { "code": "CT" }] }
				],
				"related": [{ "identifier": { "value": "ACC-42" } }]
			}
		}));

		let projected = project_document_reference(&resource).unwrap();
		assert_eq!(projected.study_instance_uid, "1.2.3.4.5.6.7.8.2");
		assert_eq!(projected.accession_number.as_deref(), Some("ACC-42"));
		assert_eq!(projected.patient_id.as_deref(), Some("PAT-001"));
		assert_eq!(projected.patient_name.as_deref(), Some("DOE^JANE"));
		assert_eq!(projected.study_date.as_deref(), Some("20240501"));
		assert_eq!(projected.study_time.as_deref(), Some("103000"));
		assert_eq!(projected.modalities_in_study, vec!["CT", "MR"]);
		assert_eq!(
			projected.referring_physician_name.as_deref(),
			Some("Dr. House")
		);
	}

	#[test]
	fn missing_study_uid_is_rejected() {
		let resource = resource_from_json(serde_json::json!({
			"resourceType": "DocumentReference",
			"description": "no master identifier"
		}));
		assert!(project_document_reference(&resource).is_none());
	}

	#[test]
	fn unknown_author_sentinel_is_ignored() {
		let resource = resource_from_json(serde_json::json!({
			"resourceType": "DocumentReference",
			"masterIdentifier": { "value": "1.2.3" },
			"author": [{ "display": "Unknown Author" }]
		}));
		let projected = project_document_reference(&resource).unwrap();
		assert!(projected.referring_physician_name.is_none());
	}

	#[test]
	fn accession_falls_back_to_identifier_system() {
		let resource = resource_from_json(serde_json::json!({
			"resourceType": "DocumentReference",
			"masterIdentifier": { "value": "1.2.3" },
			"identifier": [
				{ "system": "urn:ietf:rfc:3986", "value": "urn:oid:1.2.3" },
				{ "system": "http://pacs.example/accession", "value": "ACC-7" }
			]
		}));
		let projected = project_document_reference(&resource).unwrap();
		assert_eq!(projected.accession_number.as_deref(), Some("ACC-7"));
	}

	#[test]
	fn dicom_dates_translate_to_fhir() {
		assert_eq!(dicom_date_to_fhir("20240501"), "2024-05-01");
		assert_eq!(dicom_date_to_fhir("2024-05-01"), "2024-05-01");
	}
}
