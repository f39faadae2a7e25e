use super::fhir::Bundle;
use super::{
	dicom_date_to_fhir, project_document_reference, DocumentReference, ManifestSource, MhdError,
	StudyQuery,
};
use crate::config::UpstreamConfig;
use bytes::Bytes;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

const ACCEPT_FHIR_JSON: &str = "application/fhir+json";
const ACCEPT_DICOM: &str = "application/dicom";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for the MHD document responder (ITI-67/ITI-68).
pub struct MhdClient {
	http: reqwest::Client,
	fhir_base: String,
	manifest_base: String,
}

impl MhdClient {
	/// # Errors
	/// Returns [`MhdError::Http`] if the underlying client cannot be built.
	pub fn new(config: &UpstreamConfig) -> Result<Self, MhdError> {
		let http = reqwest::Client::builder()
			.connect_timeout(CONNECT_TIMEOUT)
			.timeout(SEARCH_TIMEOUT)
			.build()?;

		let fhir_base = config.mhd_fhir_base_url.trim_end_matches('/').to_owned();
		// The manifest endpoint lives next to the FHIR root, not inside it.
		let manifest_base = fhir_base
			.strip_suffix("/fhir")
			.unwrap_or(&fhir_base)
			.to_owned();

		Ok(Self {
			http,
			fhir_base,
			manifest_base,
		})
	}

	fn search_url(fhir_base: &str, query: &StudyQuery) -> Result<Url, MhdError> {
		let mut url = Url::parse(&format!("{fhir_base}/DocumentReference"))?;
		{
			let mut pairs = url.query_pairs_mut();
			if let Some(patient_id) = non_empty(query.patient_id.as_deref()) {
				pairs.append_pair("patient.identifier", patient_id);
			}
			if let Some(accession) = non_empty(query.accession_number.as_deref()) {
				pairs.append_pair("related.identifier", accession);
			}
			if let Some(study_uid) = non_empty(query.study_instance_uid.as_deref()) {
				pairs.append_pair("identifier", study_uid);
			}
			if let Some(modality) = non_empty(query.modality.as_deref()) {
				pairs.append_pair("event", modality);
			}
			if let Some(from) = non_empty(query.date_from.as_deref()) {
				pairs.append_pair("date", &format!("ge{}", dicom_date_to_fhir(from)));
			}
			if let Some(to) = non_empty(query.date_to.as_deref()) {
				pairs.append_pair("date", &format!("le{}", dicom_date_to_fhir(to)));
			}
		}
		Ok(url)
	}

	fn manifest_url(&self, study_instance_uid: &str) -> String {
		format!(
			"{}/mhd/studies/{study_instance_uid}/manifest",
			self.manifest_base
		)
	}
}

#[async_trait::async_trait]
impl ManifestSource for MhdClient {
	#[instrument(skip_all)]
	async fn search_document_references(
		&self,
		query: &StudyQuery,
	) -> Result<Vec<DocumentReference>, MhdError> {
		let mut next = Some(Self::search_url(&self.fhir_base, query)?);
		let mut results = Vec::new();

		while let Some(url) = next.take() {
			debug!(url = url.as_str(), "Searching DocumentReferences");
			let response = self
				.http
				.get(url.clone())
				.header(ACCEPT, ACCEPT_FHIR_JSON)
				.send()
				.await?;

			if response.status() != StatusCode::OK {
				return Err(MhdError::Upstream {
					status: response.status().as_u16(),
					url: url.to_string(),
				});
			}

			let bundle: Bundle = serde_json::from_slice(&response.bytes().await?)?;
			next = bundle.next_link().map(Url::parse).transpose()?;

			for entry in &bundle.entry {
				let Some(resource) = &entry.resource else {
					continue;
				};
				if resource.resource_type != "DocumentReference" {
					continue;
				}
				if let Some(projection) = project_document_reference(resource) {
					results.push(projection);
				} else {
					warn!("Skipping DocumentReference without a Study Instance UID");
				}
			}
		}

		debug!(count = results.len(), "DocumentReference search finished");
		Ok(results)
	}

	#[instrument(skip_all, fields(study_instance_uid))]
	async fn retrieve_manifest(
		&self,
		study_instance_uid: &str,
	) -> Result<Option<Bytes>, MhdError> {
		let url = self.manifest_url(study_instance_uid);
		let response = self
			.http
			.get(&url)
			.header(ACCEPT, ACCEPT_DICOM)
			.timeout(MANIFEST_TIMEOUT)
			.send()
			.await?;

		match response.status() {
			StatusCode::OK => Ok(Some(response.bytes().await?)),
			StatusCode::NOT_FOUND => Ok(None),
			status => Err(MhdError::Upstream {
				status: status.as_u16(),
				url,
			}),
		}
	}
}

fn non_empty(value: Option<&str>) -> Option<&str> {
	value.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client(base: &str) -> MhdClient {
		MhdClient::new(&UpstreamConfig {
			mhd_fhir_base_url: String::from(base),
			wado_rs_base_url: String::new(),
		})
		.unwrap()
	}

	#[test]
	fn manifest_url_strips_fhir_suffix() {
		let client = client("https://pacs.example/fhir");
		assert_eq!(
			client.manifest_url("1.2.3"),
			"https://pacs.example/mhd/studies/1.2.3/manifest"
		);
	}

	#[test]
	fn manifest_url_without_fhir_suffix() {
		let client = client("https://pacs.example/base/");
		assert_eq!(
			client.manifest_url("1.2.3"),
			"https://pacs.example/base/mhd/studies/1.2.3/manifest"
		);
	}

	#[test]
	fn search_url_omits_empty_parameters() {
		let query = StudyQuery {
			patient_id: Some(String::from("PAT-001")),
			accession_number: Some(String::new()),
			date_from: Some(String::from("20240101")),
			date_to: Some(String::from("20241231")),
			..StudyQuery::default()
		};
		let url = MhdClient::search_url("https://pacs.example/fhir", &query).unwrap();
		let query_string = url.query().unwrap();

		assert!(query_string.contains("patient.identifier=PAT-001"));
		assert!(!query_string.contains("related.identifier"));
		assert!(query_string.contains("date=ge2024-01-01"));
		assert!(query_string.contains("date=le2024-12-31"));
	}
}
