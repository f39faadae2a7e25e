//! C-FIND responder: dispatches the query to the metadata backend by
//! QueryRetrieveLevel and echoes back only the attributes the SCU asked for.

use super::engine::ScpContext;
use crate::dimse::association::server::ServerAssociation;
use crate::dimse::{
	commands, status, DicomMessage, DicomMessageWriter, WriteError, DATA_SET_EXISTS,
	DATA_SET_MISSING,
};
use crate::metadata::{
	InstanceKeys, InstanceMetadata, MetadataError, SeriesKeys, SeriesMetadata, StudyKeys,
	StudyMetadata,
};
use crate::types::{QueryRetrieveLevel, UI, US};
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::{debug, info, warn};

/// C-FIND-RSP
pub struct FindResponse {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl From<FindResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: FindResponse) -> Self {
        let data_set_type = if response.data.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [commands::C_FIND_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
        ]);

        Self {
            command,
            data: response.data,
            presentation_context_id: None,
        }
    }
}

pub async fn handle(
	context: &ScpContext,
	association: &ServerAssociation,
	message: DicomMessage,
	timeout: Duration,
) -> Result<(), WriteError> {
	let message_id = message.message_id();
	let affected_sop_class_uid = message
		.str_attribute(tags::AFFECTED_SOP_CLASS_UID)
		.unwrap_or_else(|| UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND));
	let presentation_context_id = message.presentation_context_id;

	let respond = |status: US, data: Option<InMemDicomObject>| FindResponse {
		message_id,
		affected_sop_class_uid: affected_sop_class_uid.clone(),
		status,
		data,
	};

	let Some(identifier) = message.data else {
		warn!("C-FIND-RQ without identifier data set");
		return association
			.write_message(
				respond(status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS, None),
				presentation_context_id,
				timeout,
			)
			.await;
	};

	let level_value = string_of(&identifier, tags::QUERY_RETRIEVE_LEVEL);
	let level = match &level_value {
		None => QueryRetrieveLevel::Study,
		Some(value) => match QueryRetrieveLevel::parse(value) {
			Some(level) => level,
			None => {
				warn!(level = value, "Unknown QueryRetrieveLevel");
				return association
					.write_message(
						respond(status::UNRECOGNIZED_OPERATION, None),
						presentation_context_id,
						timeout,
					)
					.await;
			}
		},
	};

	let results = match query(context, level, &identifier).await {
		Ok(results) => results,
		Err(err) => {
			warn!("C-FIND backend failure: {err}");
			let failure_status = match err {
				MetadataError::MissingStudyUid => status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS,
				_ => status::PROCESSING_FAILURE,
			};
			return association
				.write_message(respond(failure_status, None), presentation_context_id, timeout)
				.await;
		}
	};

	info!(matches = results.len(), %level, "C-FIND matching finished");

	for result in results {
		let filtered = apply_request_filter(&result, &identifier, level);
		debug!("Sending C-FIND pending response");
		association
			.write_message(
				respond(status::PENDING, Some(filtered)),
				presentation_context_id,
				timeout,
			)
			.await?;
	}

	debug!("Sending C-FIND final response");
	association
		.write_message(respond(status::SUCCESS, None), presentation_context_id, timeout)
		.await
}

/// Runs the backend query for the requested level and projects every match
/// into a full identifier data set.
async fn query(
	context: &ScpContext,
	level: QueryRetrieveLevel,
	identifier: &InMemDicomObject,
) -> Result<Vec<InMemDicomObject>, MetadataError> {
	match level {
		QueryRetrieveLevel::Patient | QueryRetrieveLevel::Study => {
			let keys = StudyKeys {
				patient_id: string_of(identifier, tags::PATIENT_ID),
				accession_number: string_of(identifier, tags::ACCESSION_NUMBER),
				study_instance_uid: string_of(identifier, tags::STUDY_INSTANCE_UID),
				modality: string_of(identifier, tags::MODALITIES_IN_STUDY)
					.or_else(|| string_of(identifier, tags::MODALITY)),
				study_date: string_of(identifier, tags::STUDY_DATE),
			};
			let studies = context.metadata.find_studies(&keys).await?;
			Ok(studies.iter().map(study_identifier).collect())
		}
		QueryRetrieveLevel::Series => {
			let keys = SeriesKeys {
				study_instance_uid: string_of(identifier, tags::STUDY_INSTANCE_UID),
				series_instance_uid: string_of(identifier, tags::SERIES_INSTANCE_UID),
				modality: string_of(identifier, tags::MODALITY),
			};
			let series = context.metadata.find_series(&keys).await?;
			Ok(series.iter().map(series_identifier).collect())
		}
		QueryRetrieveLevel::Image => {
			let keys = InstanceKeys {
				study_instance_uid: string_of(identifier, tags::STUDY_INSTANCE_UID),
				series_instance_uid: string_of(identifier, tags::SERIES_INSTANCE_UID),
				sop_instance_uid: string_of(identifier, tags::SOP_INSTANCE_UID),
			};
			let instances = context.metadata.find_instances(&keys).await?;
			Ok(instances.iter().map(instance_identifier).collect())
		}
	}
}

/// Builds the response data set: only attributes whose tag appears in the
/// request keys are echoed back, plus the QueryRetrieveLevel itself.
fn apply_request_filter(
	projection: &InMemDicomObject,
	request: &InMemDicomObject,
	level: QueryRetrieveLevel,
) -> InMemDicomObject {
	let mut response = InMemDicomObject::new_empty();
	for requested in request {
		let tag = requested.header().tag;
		if tag == tags::QUERY_RETRIEVE_LEVEL || tag == tags::SPECIFIC_CHARACTER_SET {
			continue;
		}
		if let Some(element) = projection.get(tag) {
			response.put(element.clone());
		}
	}
	response.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.to_string());
	response
}

fn study_identifier(study: &StudyMetadata) -> InMemDicomObject {
	let mut object = InMemDicomObject::new_empty();
	object.put_str(tags::STUDY_INSTANCE_UID, VR::UI, &study.study_instance_uid);
	put_opt(&mut object, tags::PATIENT_ID, VR::LO, study.patient_id.as_deref());
	put_opt(&mut object, tags::PATIENT_NAME, VR::PN, study.patient_name.as_deref());
	put_opt(
		&mut object,
		tags::PATIENT_BIRTH_DATE,
		VR::DA,
		study.patient_birth_date.as_deref(),
	);
	put_opt(&mut object, tags::PATIENT_SEX, VR::CS, study.patient_sex.as_deref());
	put_opt(&mut object, tags::STUDY_DATE, VR::DA, study.study_date.as_deref());
	put_opt(&mut object, tags::STUDY_TIME, VR::TM, study.study_time.as_deref());
	put_opt(&mut object, tags::STUDY_ID, VR::SH, study.study_id.as_deref());
	put_opt(
		&mut object,
		tags::STUDY_DESCRIPTION,
		VR::LO,
		study.study_description.as_deref(),
	);
	put_opt(
		&mut object,
		tags::ACCESSION_NUMBER,
		VR::SH,
		study.accession_number.as_deref(),
	);
	put_opt(
		&mut object,
		tags::REFERRING_PHYSICIAN_NAME,
		VR::PN,
		study.referring_physician_name.as_deref(),
	);
	if !study.modalities_in_study.is_empty() {
		object.put_str(tags::MODALITIES_IN_STUDY, VR::CS, study.modalities_joined());
	}
	object.put_str(
		tags::NUMBER_OF_STUDY_RELATED_SERIES,
		VR::IS,
		study.study_related_series_count.to_string(),
	);
	object.put_str(
		tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
		VR::IS,
		study.study_related_instances_count.to_string(),
	);
	put_opt(&mut object, tags::RETRIEVE_URL, VR::UR, study.retrieve_url.as_deref());
	object
}

fn series_identifier(series: &SeriesMetadata) -> InMemDicomObject {
	let mut object = InMemDicomObject::new_empty();
	object.put_str(tags::STUDY_INSTANCE_UID, VR::UI, &series.study_instance_uid);
	object.put_str(tags::SERIES_INSTANCE_UID, VR::UI, &series.series_instance_uid);
	put_opt(&mut object, tags::MODALITY, VR::CS, series.modality.as_deref());
	if let Some(series_number) = series.series_number {
		object.put_str(tags::SERIES_NUMBER, VR::IS, series_number.to_string());
	}
	put_opt(
		&mut object,
		tags::SERIES_DESCRIPTION,
		VR::LO,
		series.series_description.as_deref(),
	);
	object.put_str(
		tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
		VR::IS,
		series.instances.len().to_string(),
	);
	put_opt(&mut object, tags::RETRIEVE_URL, VR::UR, series.retrieve_url.as_deref());
	put_opt(
		&mut object,
		tags::RETRIEVE_LOCATION_UID,
		VR::UI,
		series.retrieve_location_uid.as_deref(),
	);
	object
}

fn instance_identifier(instance: &InstanceMetadata) -> InMemDicomObject {
	let mut object = InMemDicomObject::new_empty();
	object.put_str(tags::STUDY_INSTANCE_UID, VR::UI, &instance.study_instance_uid);
	object.put_str(tags::SERIES_INSTANCE_UID, VR::UI, &instance.series_instance_uid);
	object.put_str(tags::SOP_INSTANCE_UID, VR::UI, &instance.sop_instance_uid);
	object.put_str(tags::SOP_CLASS_UID, VR::UI, &instance.sop_class_uid);
	if let Some(instance_number) = instance.instance_number {
		object.put_str(tags::INSTANCE_NUMBER, VR::IS, instance_number.to_string());
	}
	if let Some(frames) = instance.number_of_frames {
		object.put_str(tags::NUMBER_OF_FRAMES, VR::IS, frames.to_string());
	}
	if let Some(rows) = instance.rows {
		object.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])));
	}
	if let Some(columns) = instance.columns {
		object.put(DataElement::new(
			tags::COLUMNS,
			VR::US,
			dicom_value!(U16, [columns]),
		));
	}
	put_opt(&mut object, tags::RETRIEVE_URL, VR::UR, instance.retrieve_url.as_deref());
	object
}

fn put_opt(object: &mut InMemDicomObject, tag: Tag, vr: VR, value: Option<&str>) {
	if let Some(value) = value {
		object.put_str(tag, vr, value);
	}
}

fn string_of(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim().to_owned())
		.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn study() -> StudyMetadata {
		StudyMetadata {
			study_instance_uid: UI::from("1.2.3.4.5.6.7.8.2"),
			patient_id: Some(String::from("PAT-001")),
			patient_name: Some(String::from("DOE^JANE")),
			modalities_in_study: vec![String::from("CT"), String::from("MR")],
			study_related_series_count: 2,
			study_related_instances_count: 3,
			..StudyMetadata::default()
		}
	}

	#[test]
	fn response_carries_only_requested_tags() {
		let mut request = InMemDicomObject::new_empty();
		request.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY");
		request.put_str(tags::PATIENT_ID, VR::LO, "");

		let projection = study_identifier(&study());
		let response = apply_request_filter(&projection, &request, QueryRetrieveLevel::Study);

		// Data sets iterate in tag order; QueryRetrieveLevel (0008,0052)
		// precedes PatientID (0010,0020).
		let tags_in_response: Vec<Tag> =
			response.into_iter().map(|element| element.header().tag).collect();
		assert_eq!(
			tags_in_response,
			vec![tags::QUERY_RETRIEVE_LEVEL, tags::PATIENT_ID]
		);
	}

	#[test]
	fn unmatched_request_keys_are_absent_from_response() {
		let mut request = InMemDicomObject::new_empty();
		request.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY");
		request.put_str(tags::PATIENT_ID, VR::LO, "");
		// Not part of the study projection at all.
		request.put_str(tags::BODY_PART_EXAMINED, VR::CS, "");

		let projection = study_identifier(&study());
		let response = apply_request_filter(&projection, &request, QueryRetrieveLevel::Study);

		assert!(response.get(tags::PATIENT_ID).is_some());
		assert!(response.get(tags::BODY_PART_EXAMINED).is_none());
	}

	#[test]
	fn study_projection_joins_modalities() {
		let projection = study_identifier(&study());
		let joined = projection
			.get(tags::MODALITIES_IN_STUDY)
			.unwrap()
			.to_str()
			.unwrap();
		assert_eq!(joined, "CT\\MR");
	}
}
