//! Minimal serde model of the FHIR resources returned by the MHD endpoint.
//! Only the fields the gateway projects are mapped; everything else is ignored.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bundle {
	pub link: Vec<BundleLink>,
	pub entry: Vec<BundleEntry>,
}

impl Bundle {
	/// URL of the `next` page, if the server paginated the result.
	pub fn next_link(&self) -> Option<&str> {
		self.link
			.iter()
			.find(|link| link.relation == "next")
			.map(|link| link.url.as_str())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleLink {
	pub relation: String,
	pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleEntry {
	pub resource: Option<DocumentReferenceResource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentReferenceResource {
	pub resource_type: String,
	pub master_identifier: Option<Identifier>,
	pub identifier: Vec<Identifier>,
	pub subject: Option<Reference>,
	pub date: Option<String>,
	pub author: Vec<Reference>,
	pub description: Option<String>,
	pub context: Option<DocumentContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Identifier {
	pub system: Option<String>,
	pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Reference {
	pub reference: Option<String>,
	pub display: Option<String>,
	pub identifier: Option<Identifier>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentContext {
	pub event: Vec<CodeableConcept>,
	pub related: Vec<Reference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeableConcept {
	pub coding: Vec<Coding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Coding {
	pub system: Option<String>,
	pub code: Option<String>,
	pub display: Option<String>,
}
