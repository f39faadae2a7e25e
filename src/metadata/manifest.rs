//! Parser for MADO manifests: Key Object Selection documents whose evidence
//! sequence lists the retrievable series/instances and whose TID-1600 content
//! tree ("Image Library") carries descriptive attributes for them.

use super::model::{InstanceMetadata, SeriesMetadata, StudyMetadata};
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use thiserror::Error;
use tracing::warn;

/// Concept code of the TID-1600 "Image Library" container.
const CODE_IMAGE_LIBRARY: &str = "111028";
/// Concept code of a TID-1600 "Image Library Group" container.
const CODE_IMAGE_LIBRARY_GROUP: &str = "126200";
const SCHEME_DCM: &str = "DCM";

const CODE_SERIES_UID: &str = "ddd006";
const CODE_SERIES_DESCRIPTION: &str = "ddd007";
/// Modern and legacy concept codes for the series number.
const CODES_SERIES_NUMBER: [&str; 2] = ["ddd010", "ddd005"];
/// Modern and legacy concept codes for the instance number.
const CODES_INSTANCE_NUMBER: [&str; 2] = ["ddd012", "ddd005"];
const CODE_NUMBER_OF_FRAMES: &str = "ddd008";

const PREAMBLE_LENGTH: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Error)]
pub enum ManifestError {
	#[error("Manifest bytes are not a readable DICOM object: {0}")]
	Parse(#[from] dicom::object::ReadError),
	#[error("Manifest is too short to be a DICOM file ({0} bytes)")]
	Truncated(usize),
	#[error("Manifest carries no Study Instance UID")]
	MissingStudyUid,
}

/// Parses manifest bytes into the study metadata tree.
///
/// # Errors
/// Fails when the bytes are not decodable DICOM or identify no study.
/// Individual malformed SR content items are skipped, not fatal.
pub fn parse(bytes: &[u8]) -> Result<StudyMetadata, ManifestError> {
	let dataset = read_dataset(bytes)?;
	build_study(&dataset)
}

fn read_dataset(bytes: &[u8]) -> Result<InMemDicomObject, ManifestError> {
	let has_preamble = bytes.len() >= PREAMBLE_LENGTH + MAGIC.len()
		&& &bytes[PREAMBLE_LENGTH..PREAMBLE_LENGTH + MAGIC.len()] == MAGIC;
	let has_bare_magic = bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC;

	let stream = if has_preamble {
		&bytes[PREAMBLE_LENGTH..]
	} else if has_bare_magic {
		bytes
	} else {
		return Err(ManifestError::Truncated(bytes.len()));
	};

	Ok(dicom::object::from_reader(stream)?.into_inner())
}

fn build_study(dataset: &InMemDicomObject) -> Result<StudyMetadata, ManifestError> {
	let study_instance_uid =
		string_of(dataset, tags::STUDY_INSTANCE_UID).ok_or(ManifestError::MissingStudyUid)?;

	let mut study = StudyMetadata {
		study_instance_uid: study_instance_uid.clone(),
		patient_id: string_of(dataset, tags::PATIENT_ID),
		patient_name: string_of(dataset, tags::PATIENT_NAME),
		patient_birth_date: string_of(dataset, tags::PATIENT_BIRTH_DATE),
		patient_sex: string_of(dataset, tags::PATIENT_SEX),
		study_date: string_of(dataset, tags::STUDY_DATE),
		study_time: string_of(dataset, tags::STUDY_TIME),
		study_id: string_of(dataset, tags::STUDY_ID),
		study_description: string_of(dataset, tags::STUDY_DESCRIPTION),
		accession_number: string_of(dataset, tags::ACCESSION_NUMBER),
		referring_physician_name: string_of(dataset, tags::REFERRING_PHYSICIAN_NAME),
		..StudyMetadata::default()
	};

	for study_item in items_of(dataset, tags::CURRENT_REQUESTED_PROCEDURE_EVIDENCE_SEQUENCE) {
		let evidence_study_uid =
			string_of(study_item, tags::STUDY_INSTANCE_UID).unwrap_or_else(|| study_instance_uid.clone());

		for series_item in items_of(study_item, tags::REFERENCED_SERIES_SEQUENCE) {
			let Some(series_instance_uid) = string_of(series_item, tags::SERIES_INSTANCE_UID)
			else {
				warn!("Skipping referenced series without SeriesInstanceUID");
				continue;
			};

			let mut series = SeriesMetadata {
				study_instance_uid: evidence_study_uid.clone(),
				series_instance_uid: series_instance_uid.clone(),
				modality: string_of(series_item, tags::MODALITY),
				retrieve_url: string_of(series_item, tags::RETRIEVE_URL),
				retrieve_location_uid: string_of(series_item, tags::RETRIEVE_LOCATION_UID),
				..SeriesMetadata::default()
			};

			for sop_item in items_of(series_item, tags::REFERENCED_SOP_SEQUENCE) {
				let Some(sop_instance_uid) =
					string_of(sop_item, tags::REFERENCED_SOP_INSTANCE_UID)
				else {
					warn!("Skipping referenced SOP item without ReferencedSOPInstanceUID");
					continue;
				};
				let Some(sop_class_uid) = string_of(sop_item, tags::REFERENCED_SOP_CLASS_UID)
				else {
					warn!(
						sop_instance_uid,
						"Skipping referenced SOP item without ReferencedSOPClassUID"
					);
					continue;
				};

				let retrieve_url = string_of(sop_item, tags::RETRIEVE_URL).or_else(|| {
					series
						.retrieve_url
						.as_ref()
						.map(|series_url| format!("{series_url}/instances/{sop_instance_uid}"))
				});

				series.instances.push(InstanceMetadata {
					study_instance_uid: evidence_study_uid.clone(),
					series_instance_uid: series_instance_uid.clone(),
					sop_instance_uid,
					sop_class_uid,
					instance_number: int_of(sop_item, tags::INSTANCE_NUMBER),
					number_of_frames: int_of(sop_item, tags::NUMBER_OF_FRAMES),
					rows: int_of(sop_item, tags::ROWS).and_then(|rows| u16::try_from(rows).ok()),
					columns: int_of(sop_item, tags::COLUMNS)
						.and_then(|columns| u16::try_from(columns).ok()),
					retrieve_url,
				});
			}

			study.series.push(series);
		}
	}

	enrich_from_image_library(dataset, &mut study);
	study.finalize();

	study.retrieve_url = study.series.iter().find_map(|series| {
		let url = series.retrieve_url.as_deref()?;
		url.rfind("/series/").map(|index| url[..index].to_owned())
	});

	Ok(study)
}

/// TID-1600 enrichment: copies series/instance attributes out of the
/// "Image Library" content tree onto the already-built evidence tree.
fn enrich_from_image_library(dataset: &InMemDicomObject, study: &mut StudyMetadata) {
	let Some(library) = find_container(dataset, CODE_IMAGE_LIBRARY) else {
		return;
	};

	for group in items_of(library, tags::CONTENT_SEQUENCE) {
		if value_type(group).as_deref() != Some("CONTAINER")
			|| !has_concept(group, CODE_IMAGE_LIBRARY_GROUP, Some(SCHEME_DCM))
		{
			continue;
		}

		let series_uid = content_children(group)
			.find(|child| {
				value_type(child).as_deref() == Some("UIDREF")
					&& has_concept(child, CODE_SERIES_UID, None)
			})
			.and_then(|child| string_of(child, tags::UID));

		if let Some(series_uid) = &series_uid {
			if let Some(series) = study
				.series
				.iter_mut()
				.find(|series| &series.series_instance_uid == series_uid)
			{
				if let Some(description) = text_child(group, &[CODE_SERIES_DESCRIPTION]) {
					series.series_description = Some(description);
				}
				if let Some(number) = numeric_child(group, &CODES_SERIES_NUMBER) {
					series.series_number = Some(number);
				}
			}
		}

		for image in content_children(group) {
			if value_type(image).as_deref() != Some("IMAGE") {
				continue;
			}
			let Some(sop_instance_uid) = items_of(image, tags::REFERENCED_SOP_SEQUENCE)
				.next()
				.and_then(|reference| string_of(reference, tags::REFERENCED_SOP_INSTANCE_UID))
			else {
				continue;
			};

			let Some(instance) = study
				.series
				.iter_mut()
				.flat_map(|series| series.instances.iter_mut())
				.find(|instance| instance.sop_instance_uid == sop_instance_uid)
			else {
				continue;
			};

			if let Some(number) = numeric_child(image, &CODES_INSTANCE_NUMBER) {
				instance.instance_number = Some(number);
			}
			if let Some(frames) = numeric_child(image, &[CODE_NUMBER_OF_FRAMES]) {
				instance.number_of_frames = Some(frames);
			}
		}
	}
}

/// Depth-first search for a CONTAINER content item with the given concept code.
fn find_container<'a>(item: &'a InMemDicomObject, code: &str) -> Option<&'a InMemDicomObject> {
	for child in items_of(item, tags::CONTENT_SEQUENCE) {
		if value_type(child).as_deref() == Some("CONTAINER") {
			if has_concept(child, code, Some(SCHEME_DCM)) {
				return Some(child);
			}
			if let Some(found) = find_container(child, code) {
				return Some(found);
			}
		}
	}
	None
}

fn content_children(item: &InMemDicomObject) -> impl Iterator<Item = &InMemDicomObject> {
	items_of(item, tags::CONTENT_SEQUENCE)
}

fn value_type(item: &InMemDicomObject) -> Option<String> {
	string_of(item, tags::VALUE_TYPE)
}

fn has_concept(item: &InMemDicomObject, code: &str, scheme: Option<&str>) -> bool {
	items_of(item, tags::CONCEPT_NAME_CODE_SEQUENCE)
		.next()
		.is_some_and(|concept| {
			string_of(concept, tags::CODE_VALUE).as_deref() == Some(code)
				&& scheme.is_none_or(|scheme| {
					string_of(concept, tags::CODING_SCHEME_DESIGNATOR).as_deref() == Some(scheme)
				})
		})
}

/// First TEXT child with one of the given concept codes.
fn text_child(item: &InMemDicomObject, codes: &[&str]) -> Option<String> {
	content_children(item).find_map(|child| {
		(value_type(child).as_deref() == Some("TEXT")
			&& codes.iter().any(|code| has_concept(child, code, None)))
		.then(|| string_of(child, tags::TEXT_VALUE))
		.flatten()
	})
}

/// First NUM (or TEXT fallback) child with one of the given concept codes.
fn numeric_child(item: &InMemDicomObject, codes: &[&str]) -> Option<i32> {
	content_children(item).find_map(|child| {
		if !codes.iter().any(|code| has_concept(child, code, None)) {
			return None;
		}
		match value_type(child).as_deref() {
			Some("NUM") => items_of(child, tags::MEASURED_VALUE_SEQUENCE)
				.next()
				.and_then(|measured| int_of(measured, tags::NUMERIC_VALUE)),
			Some("TEXT") => string_of(child, tags::TEXT_VALUE)
				.and_then(|text| text.trim().parse::<i32>().ok()),
			_ => None,
		}
	})
}

fn string_of(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim().to_owned())
		.filter(|value| !value.is_empty())
}

fn int_of(object: &InMemDicomObject, tag: Tag) -> Option<i32> {
	let element = object.get(tag)?;
	element
		.to_int::<i32>()
		.ok()
		.or_else(|| element.to_float64().ok().map(|value| value as i32))
}

fn items_of(object: &InMemDicomObject, tag: Tag) -> impl Iterator<Item = &InMemDicomObject> {
	object
		.get(tag)
		.and_then(InMemElement::items)
		.into_iter()
		.flatten()
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::value::{DataSetSequence, Value};
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;

	fn seq(tag: Tag, items: Vec<InMemDicomObject>) -> DataElement<InMemDicomObject> {
		DataElement::new(tag, VR::SQ, Value::Sequence(DataSetSequence::from(items)))
	}

	fn str_el(tag: Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
		DataElement::new(tag, vr, dicom_value!(Str, value))
	}

	fn concept(code: &str, scheme: &str) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			str_el(tags::CODE_VALUE, VR::SH, code),
			str_el(tags::CODING_SCHEME_DESIGNATOR, VR::SH, scheme),
		])
	}

	fn sop_item(sop_class: &str, sop_instance: &str) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			str_el(tags::REFERENCED_SOP_CLASS_UID, VR::UI, sop_class),
			str_el(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, sop_instance),
		])
	}

	fn num_item(code: &str, value: &str) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			str_el(tags::VALUE_TYPE, VR::CS, "NUM"),
			seq(tags::CONCEPT_NAME_CODE_SEQUENCE, vec![concept(code, "MADO")]),
			seq(
				tags::MEASURED_VALUE_SEQUENCE,
				vec![InMemDicomObject::from_element_iter([str_el(
					tags::NUMERIC_VALUE,
					VR::DS,
					value,
				)])],
			),
		])
	}

	fn text_item(code: &str, value: &str) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			str_el(tags::VALUE_TYPE, VR::CS, "TEXT"),
			seq(tags::CONCEPT_NAME_CODE_SEQUENCE, vec![concept(code, "MADO")]),
			str_el(tags::TEXT_VALUE, VR::UT, value),
		])
	}

	fn uidref_item(code: &str, uid: &str) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			str_el(tags::VALUE_TYPE, VR::CS, "UIDREF"),
			seq(tags::CONCEPT_NAME_CODE_SEQUENCE, vec![concept(code, "MADO")]),
			str_el(tags::UID, VR::UI, uid),
		])
	}

	fn image_item(sop_instance: &str, children: Vec<InMemDicomObject>) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			str_el(tags::VALUE_TYPE, VR::CS, "IMAGE"),
			seq(
				tags::REFERENCED_SOP_SEQUENCE,
				vec![sop_item("1.2.840.10008.5.1.4.1.1.2", sop_instance)],
			),
			seq(tags::CONTENT_SEQUENCE, children),
		])
	}

	fn fixture_dataset() -> InMemDicomObject {
		let ct_series = InMemDicomObject::from_element_iter([
			str_el(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4.5.6.7.8.3"),
			str_el(tags::MODALITY, VR::CS, "CT"),
			str_el(
				tags::RETRIEVE_URL,
				VR::UR,
				"http://pacs/wado/studies/1.2.3.4.5.6.7.8.2/series/1.2.3.4.5.6.7.8.3",
			),
			str_el(tags::RETRIEVE_LOCATION_UID, VR::UI, "1.2.3.99"),
			seq(
				tags::REFERENCED_SOP_SEQUENCE,
				vec![sop_item("1.2.840.10008.5.1.4.1.1.2", "1.2.3.4.5.6.7.8.10")],
			),
		]);
		let mr_series = InMemDicomObject::from_element_iter([
			str_el(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4.5.6.7.8.100"),
			str_el(tags::MODALITY, VR::CS, "MR"),
			seq(
				tags::REFERENCED_SOP_SEQUENCE,
				vec![
					sop_item("1.2.840.10008.5.1.4.1.1.4", "1.2.3.4.5.6.7.8.11"),
					sop_item("1.2.840.10008.5.1.4.1.1.4", "1.2.3.4.5.6.7.8.12"),
				],
			),
		]);

		let study_item = InMemDicomObject::from_element_iter([
			str_el(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3.4.5.6.7.8.2"),
			seq(tags::REFERENCED_SERIES_SEQUENCE, vec![ct_series, mr_series]),
		]);

		let library_group = InMemDicomObject::from_element_iter([
			str_el(tags::VALUE_TYPE, VR::CS, "CONTAINER"),
			seq(
				tags::CONCEPT_NAME_CODE_SEQUENCE,
				vec![concept(CODE_IMAGE_LIBRARY_GROUP, SCHEME_DCM)],
			),
			seq(
				tags::CONTENT_SEQUENCE,
				vec![
					uidref_item(CODE_SERIES_UID, "1.2.3.4.5.6.7.8.3"),
					text_item(CODE_SERIES_DESCRIPTION, "Arterial phase"),
					num_item("ddd005", "4"),
					image_item(
						"1.2.3.4.5.6.7.8.10",
						vec![num_item("ddd012", "1"), num_item(CODE_NUMBER_OF_FRAMES, "2")],
					),
				],
			),
		]);
		let library = InMemDicomObject::from_element_iter([
			str_el(tags::VALUE_TYPE, VR::CS, "CONTAINER"),
			seq(
				tags::CONCEPT_NAME_CODE_SEQUENCE,
				vec![concept(CODE_IMAGE_LIBRARY, SCHEME_DCM)],
			),
			seq(tags::CONTENT_SEQUENCE, vec![library_group]),
		]);

		InMemDicomObject::from_element_iter([
			str_el(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3.4.5.6.7.8.2"),
			str_el(tags::PATIENT_ID, VR::LO, "PAT-001"),
			str_el(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
			str_el(tags::ACCESSION_NUMBER, VR::SH, "ACC-42"),
			seq(
				tags::CURRENT_REQUESTED_PROCEDURE_EVIDENCE_SEQUENCE,
				vec![study_item],
			),
			seq(tags::CONTENT_SEQUENCE, vec![library]),
		])
	}

	#[test]
	fn builds_tree_with_derived_counts() {
		let study = build_study(&fixture_dataset()).unwrap();

		assert_eq!(study.study_instance_uid, "1.2.3.4.5.6.7.8.2");
		assert_eq!(study.study_related_series_count, 2);
		assert_eq!(study.study_related_instances_count, 3);
		assert_eq!(
			study.study_related_instances_count,
			study.series.iter().map(|s| s.instances.len()).sum::<usize>()
		);
		assert_eq!(study.modalities_in_study, vec!["CT", "MR"]);
	}

	#[test]
	fn derives_instance_and_study_urls() {
		let study = build_study(&fixture_dataset()).unwrap();

		let ct = study.series_by_uid("1.2.3.4.5.6.7.8.3").unwrap();
		assert_eq!(
			ct.instances[0].retrieve_url.as_deref(),
			Some("http://pacs/wado/studies/1.2.3.4.5.6.7.8.2/series/1.2.3.4.5.6.7.8.3/instances/1.2.3.4.5.6.7.8.10")
		);
		assert_eq!(
			study.retrieve_url.as_deref(),
			Some("http://pacs/wado/studies/1.2.3.4.5.6.7.8.2")
		);
	}

	#[test]
	fn enrichment_accepts_legacy_and_modern_codes() {
		let study = build_study(&fixture_dataset()).unwrap();

		let ct = study.series_by_uid("1.2.3.4.5.6.7.8.3").unwrap();
		assert_eq!(ct.series_description.as_deref(), Some("Arterial phase"));
		// Series number arrived under the legacy code.
		assert_eq!(ct.series_number, Some(4));

		let instance = &ct.instances[0];
		assert_eq!(instance.instance_number, Some(1));
		assert_eq!(instance.number_of_frames, Some(2));
	}

	#[test]
	fn evidence_sop_uids_round_trip() {
		let dataset = fixture_dataset();
		let study = build_study(&dataset).unwrap();

		let mut parsed: Vec<String> = study
			.series
			.iter()
			.flat_map(|series| series.instances.iter())
			.map(|instance| instance.sop_instance_uid.clone())
			.collect();
		parsed.sort();

		let mut original = Vec::new();
		for study_item in items_of(&dataset, tags::CURRENT_REQUESTED_PROCEDURE_EVIDENCE_SEQUENCE) {
			for series_item in items_of(study_item, tags::REFERENCED_SERIES_SEQUENCE) {
				for sop_item in items_of(series_item, tags::REFERENCED_SOP_SEQUENCE) {
					original.push(string_of(sop_item, tags::REFERENCED_SOP_INSTANCE_UID).unwrap());
				}
			}
		}
		original.sort();

		assert_eq!(parsed, original);
	}

	#[test]
	fn invalid_sr_items_are_skipped() {
		let bogus_series = InMemDicomObject::from_element_iter([
			// No SeriesInstanceUID at all.
			str_el(tags::MODALITY, VR::CS, "CT"),
		]);
		let study_item = InMemDicomObject::from_element_iter([seq(
			tags::REFERENCED_SERIES_SEQUENCE,
			vec![bogus_series],
		)]);
		let dataset = InMemDicomObject::from_element_iter([
			str_el(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
			seq(
				tags::CURRENT_REQUESTED_PROCEDURE_EVIDENCE_SEQUENCE,
				vec![study_item],
			),
		]);

		let study = build_study(&dataset).unwrap();
		assert!(study.series.is_empty());
		assert_eq!(study.study_related_instances_count, 0);
	}

	#[test]
	fn garbage_bytes_are_rejected() {
		assert!(matches!(
			parse(&[0u8; 64]),
			Err(ManifestError::Truncated(64))
		));
	}
}
