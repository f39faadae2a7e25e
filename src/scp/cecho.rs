use crate::dimse::association::server::ServerAssociation;
use crate::dimse::{commands, status, DicomMessage, DicomMessageWriter, WriteError, DATA_SET_MISSING};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::debug;

/// C-ECHO-RSP
pub struct EchoResponse {
	pub message_id: US,
}

impl From<EchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: EchoResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [commands::C_ECHO_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status::SUCCESS])),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

/// Verification is answered with Success unconditionally.
pub async fn handle(
	association: &ServerAssociation,
	message: &DicomMessage,
	timeout: Duration,
) -> Result<(), WriteError> {
	let message_id = message.message_id();
	debug!(message_id, "Responding to C-ECHO-RQ");

	association
		.write_message(
			EchoResponse { message_id },
			message.presentation_context_id,
			timeout,
		)
		.await
}
