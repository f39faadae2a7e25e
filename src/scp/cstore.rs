//! Outbound C-STORE sub-operations issued on the per-bucket association
//! during C-MOVE processing.

use crate::dimse::association::client::ClientAssociation;
use crate::dimse::{
	commands, next_message_id, status, DicomMessage, DicomMessageReader, DicomMessageWriter,
	StatusType, DATA_SET_EXISTS,
};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::{debug, warn};

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
        let mut command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [commands::C_STORE_RQ])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
        ]);

        if let Some(move_originator_message_id) = request.move_originator_message_id {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
        }

        if let Some(move_originator_aet) = request.move_originator_aet {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
        }

        Self {
            command,
            data: Some(request.data_set),
            presentation_context_id: None
        }
    }
}

/// Identity of the C-MOVE request a sub-operation belongs to, echoed in the
/// store command so the receiver can correlate.
#[derive(Debug, Clone)]
pub struct MoveOriginator {
	pub aet: AE,
	pub message_id: US,
}

/// Issues a single C-STORE on the shared bucket association and awaits the
/// response. Returns whether the peer reported success. Transport errors and
/// non-success statuses are logged and count as failure; they never abort the
/// bucket.
pub async fn store_instance(
	association: &ClientAssociation,
	sop_class_uid: &str,
	sop_instance_uid: &str,
	data_set: InMemDicomObject,
	originator: &MoveOriginator,
	timeout: Duration,
) -> bool {
	let request = CompositeStoreRequest {
		affected_sop_class_uid: UI::from(sop_class_uid),
		affected_sop_instance_uid: UI::from(sop_instance_uid),
		move_originator_aet: Some(originator.aet.clone()),
		move_originator_message_id: Some(originator.message_id),
		message_id: next_message_id(),
		priority: crate::types::Priority::Medium as US,
		data_set,
	};

	if let Err(err) = association.write_message(request, None, timeout).await {
		warn!(sop_instance_uid, "Failed to send C-STORE-RQ: {err}");
		return false;
	}

	let response = match association.read_message(timeout).await {
		Ok(response) => response,
		Err(err) => {
			warn!(sop_instance_uid, "Failed to read C-STORE-RSP: {err}");
			return false;
		}
	};

	let store_status = response.status_type().unwrap_or(StatusType::Failure);

	match store_status {
		StatusType::Success => {
			debug!(sop_instance_uid, "C-STORE sub-operation completed");
			true
		}
		_ => {
			warn!(
				sop_instance_uid,
				status = response.int_attribute(tags::STATUS).unwrap_or(status::UNABLE_TO_PROCESS),
				"C-STORE sub-operation failed"
			);
			false
		}
	}
}
