//! Onboarding state machine calculator.
//!
//! Given an integration's current configuration, report which value is still
//! needed. Transitions happen only when the presentation layer submits a value
//! back into the integration (`submit_value`). Backfill onboarding additionally
//! checks credentials against the source API and clears rejected ones so the
//! step re-prompts.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::WebhookConfig;
use crate::models::{IntegrationId, ServiceIntegration};
use crate::replicator::traits::{OnboardingRequirements, Replicator};
use crate::store::traits::IntegrationStore;
use crate::{Error, Result};

pub const INVALID_CREDENTIALS: &str = "invalid_credentials";

/// What the presentation layer should show next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineStep {
    pub needs_input: bool,
    pub prompt: Option<String>,
    pub prompt_is_secret: bool,
    /// Where the submitted value must be posted.
    pub post_to_url: Option<String>,
    pub complete: bool,
    pub output_text: Option<String>,
    pub error_code: Option<String>,
}

impl StateMachineStep {
    fn input(field: OnboardingField, integration: &ServiceIntegration, config: &WebhookConfig) -> Self {
        Self {
            needs_input: true,
            prompt: Some(field.prompt().to_string()),
            prompt_is_secret: field.is_secret(),
            post_to_url: Some(config.onboarding_url(&integration.opaque_id, field.as_str())),
            ..Self::default()
        }
    }

    fn done(output_text: String) -> Self {
        Self {
            complete: true,
            output_text: Some(output_text),
            ..Self::default()
        }
    }

    fn with_error(mut self, code: &str) -> Self {
        self.error_code = Some(code.to_string());
        self
    }
}

/// A configuration field an onboarding step collects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingField {
    ApiUrl,
    WebhookSecret,
    BackfillKey,
    BackfillSecret,
}

impl OnboardingField {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnboardingField::ApiUrl => "api_url",
            OnboardingField::WebhookSecret => "webhook_secret",
            OnboardingField::BackfillKey => "backfill_key",
            OnboardingField::BackfillSecret => "backfill_secret",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "api_url" => Some(Self::ApiUrl),
            "webhook_secret" => Some(Self::WebhookSecret),
            "backfill_key" => Some(Self::BackfillKey),
            "backfill_secret" => Some(Self::BackfillSecret),
            _ => None,
        }
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            OnboardingField::ApiUrl => "Enter the base URL of the service API",
            OnboardingField::WebhookSecret => "Enter the webhook signing secret issued by the service",
            OnboardingField::BackfillKey => "Enter the API key used to read historical data",
            OnboardingField::BackfillSecret => "Enter the API secret used to read historical data",
        }
    }

    pub fn is_secret(&self) -> bool {
        !matches!(self, OnboardingField::ApiUrl)
    }

    fn slot(self, integration: &mut ServiceIntegration) -> &mut Option<String> {
        match self {
            OnboardingField::ApiUrl => &mut integration.api_url,
            OnboardingField::WebhookSecret => &mut integration.webhook_secret,
            OnboardingField::BackfillKey => &mut integration.backfill_key,
            OnboardingField::BackfillSecret => &mut integration.backfill_secret,
        }
    }

    fn is_set(self, integration: &ServiceIntegration) -> bool {
        let value = match self {
            OnboardingField::ApiUrl => &integration.api_url,
            OnboardingField::WebhookSecret => &integration.webhook_secret,
            OnboardingField::BackfillKey => &integration.backfill_key,
            OnboardingField::BackfillSecret => &integration.backfill_secret,
        };
        value.as_deref().is_some_and(|v| !v.trim().is_empty())
    }
}

fn first_missing(
    integration: &ServiceIntegration,
    fields: &[(bool, OnboardingField)],
) -> Option<OnboardingField> {
    fields
        .iter()
        .find(|(required, field)| *required && !field.is_set(integration))
        .map(|(_, field)| *field)
}

fn webhook_fields(req: &OnboardingRequirements) -> [(bool, OnboardingField); 2] {
    [
        (req.api_url, OnboardingField::ApiUrl),
        (req.webhook_secret, OnboardingField::WebhookSecret),
    ]
}

fn backfill_fields(req: &OnboardingRequirements) -> [(bool, OnboardingField); 3] {
    [
        (req.api_url, OnboardingField::ApiUrl),
        (req.backfill_key, OnboardingField::BackfillKey),
        (req.backfill_secret, OnboardingField::BackfillSecret),
    ]
}

/// Webhook onboarding: pure function of the integration's configuration.
pub fn calculate_webhook_state_machine(
    replicator: &dyn Replicator,
    config: &WebhookConfig,
) -> StateMachineStep {
    let integration = replicator.integration();
    let requirements = replicator.onboarding_requirements();
    if let Some(field) = first_missing(integration, &webhook_fields(&requirements)) {
        return StateMachineStep::input(field, integration, config);
    }

    let mut text = format!(
        "Send webhooks to {}",
        config.webhook_url(&integration.opaque_id)
    );
    if let Some(extra) = requirements.webhook_instructions.as_deref() {
        text.push('\n');
        text.push_str(extra);
    }
    StateMachineStep::done(text)
}

/// Backfill onboarding. Once every credential is present it is checked against
/// the source API; a rejection clears the submitted credentials and re-prompts.
#[tracing::instrument(level = "debug", skip_all, fields(integration = %replicator.integration().id))]
pub async fn calculate_backfill_state_machine(
    replicator: &dyn Replicator,
    integrations: &dyn IntegrationStore,
    config: &WebhookConfig,
) -> Result<StateMachineStep> {
    let integration = replicator.integration();
    if replicator.backfill_source().is_none() {
        return Ok(StateMachineStep::done(format!(
            "{} does not support backfill",
            replicator.service_name()
        )));
    }

    let requirements = replicator.onboarding_requirements();
    let fields = backfill_fields(&requirements);
    if let Some(field) = first_missing(integration, &fields) {
        return Ok(StateMachineStep::input(field, integration, config));
    }

    if let Some(verifier) = replicator.credential_verifier() {
        match verifier.verify(integration).await {
            Ok(()) => {}
            Err(err @ Error::UpstreamFetch { .. }) => {
                tracing::warn!(error = %err, "backfill credentials rejected by source");
                if !requirements.backfill_key && !requirements.backfill_secret {
                    // Nothing to re-prompt for; the source refused an unauthenticated read.
                    return Ok(StateMachineStep {
                        output_text: Some(format!(
                            "{} refused access to its API ({err}); check the source's configuration and retry",
                            replicator.service_name()
                        )),
                        ..StateMachineStep::default()
                    }
                    .with_error(INVALID_CREDENTIALS));
                }
                let mut cleared = integration.clone();
                for (required, field) in [
                    (requirements.backfill_key, OnboardingField::BackfillKey),
                    (requirements.backfill_secret, OnboardingField::BackfillSecret),
                ] {
                    if required {
                        *field.slot(&mut cleared) = None;
                    }
                }
                cleared.touch(Utc::now());
                integrations.update_integration(&cleared).await?;

                return Ok(match first_missing(&cleared, &fields) {
                    Some(field) => StateMachineStep::input(field, &cleared, config),
                    None => StateMachineStep::default(),
                }
                .with_error(INVALID_CREDENTIALS));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(StateMachineStep::done(
        "Credentials verified; historical data can now be backfilled".to_string(),
    ))
}

/// Store a submitted onboarding value on the integration.
#[tracing::instrument(level = "debug", skip(integrations, value))]
pub async fn submit_value(
    integrations: &dyn IntegrationStore,
    integration_id: IntegrationId,
    field: OnboardingField,
    value: &str,
) -> Result<ServiceIntegration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{} is empty", field.as_str())));
    }
    if field == OnboardingField::ApiUrl
        && !(value.starts_with("https://") || value.starts_with("http://"))
    {
        return Err(Error::InvalidInput(
            "api_url must be an http(s) url".to_string(),
        ));
    }

    let mut integration = integrations
        .get_integration(integration_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("integration {integration_id} not found")))?;
    let value = match field {
        OnboardingField::ApiUrl => value.trim_end_matches('/'),
        _ => value,
    };
    *field.slot(&mut integration) = Some(value.to_string());
    integration.touch(Utc::now());
    integrations.update_integration(&integration).await?;
    Ok(integration)
}
