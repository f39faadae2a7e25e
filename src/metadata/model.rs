use crate::types::UI;

/// Study-level metadata assembled from a MADO manifest or projected from an
/// MHD DocumentReference. Owned top-down; series and instances refer back to
/// their parents by UID only.
#[derive(Debug, Clone, Default)]
pub struct StudyMetadata {
	pub study_instance_uid: UI,
	pub patient_id: Option<String>,
	pub patient_name: Option<String>,
	pub patient_birth_date: Option<String>,
	pub patient_sex: Option<String>,
	pub study_date: Option<String>,
	pub study_time: Option<String>,
	pub study_id: Option<String>,
	pub study_description: Option<String>,
	pub accession_number: Option<String>,
	pub referring_physician_name: Option<String>,
	/// Distinct series modalities, in first-seen order.
	pub modalities_in_study: Vec<String>,
	pub study_related_series_count: usize,
	pub study_related_instances_count: usize,
	pub retrieve_url: Option<String>,
	pub series: Vec<SeriesMetadata>,
}

impl StudyMetadata {
	/// Multi-valued DICOM attributes are backslash-joined on the wire.
	pub fn modalities_joined(&self) -> String {
		self.modalities_in_study.join("\\")
	}

	pub fn series_by_uid(&self, series_instance_uid: &str) -> Option<&SeriesMetadata> {
		self.series
			.iter()
			.find(|series| series.series_instance_uid == series_instance_uid)
	}

	/// Recomputes the derived study-level fields from the series tree.
	pub fn finalize(&mut self) {
		self.study_related_series_count = self.series.len();
		self.study_related_instances_count =
			self.series.iter().map(|series| series.instances.len()).sum();

		let mut modalities: Vec<String> = Vec::new();
		for series in &self.series {
			if let Some(modality) = &series.modality {
				if !modalities.iter().any(|known| known == modality) {
					modalities.push(modality.clone());
				}
			}
		}
		self.modalities_in_study = modalities;
	}
}

#[derive(Debug, Clone, Default)]
pub struct SeriesMetadata {
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	/// Two-letter DICOM CS code, e.g. `CT` or `MR`.
	pub modality: Option<String>,
	pub series_number: Option<i32>,
	pub series_description: Option<String>,
	/// WADO-RS base URL for this series.
	pub retrieve_url: Option<String>,
	pub retrieve_location_uid: Option<UI>,
	pub instances: Vec<InstanceMetadata>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceMetadata {
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	pub sop_class_uid: UI,
	pub instance_number: Option<i32>,
	pub number_of_frames: Option<i32>,
	pub rows: Option<u16>,
	pub columns: Option<u16>,
	pub retrieve_url: Option<String>,
}
