use crate::model::CampaignStatus;

/// Campaign row joined with its template, as the job handler needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignForSend {
    pub campaign_id: String,
    pub org_id: String,
    pub account_id: Option<String>,
    pub status: CampaignStatus,
    pub template_name: String,
    pub template_language: String,
    pub template_body: String,
}
