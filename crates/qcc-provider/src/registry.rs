//! Capability registry client: asks providers, in order, for a matching cell.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qcc_core::{CapabilityRequirement, Error, Result};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::protocol::{CellDescriptor, CellRequest, ProviderResponse, RequestStatus};

/// A service able to deliver cells for capabilities.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Stable identifier, used for fallback bookkeeping and trust checks.
    fn id(&self) -> &str;

    async fn request_cell(&self, request: &CellRequest) -> Result<ProviderResponse>;
}

/// Provider reached over HTTP: `POST {base_url}/cells/request`.
pub struct HttpProvider {
    base_url: String,
    client: Client,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl CapabilityProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.base_url
    }

    async fn request_cell(&self, request: &CellRequest) -> Result<ProviderResponse> {
        let url = format!("{}/cells/request", self.base_url);
        debug!("Requesting {} from {}", request.capability, url);

        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(ProviderResponse::not_found(&request.request_id));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("{} returned {}: {}", url, status, body)));
        }

        resp.json::<ProviderResponse>()
            .await
            .map_err(|e| Error::Provider(format!("{}: malformed response: {}", url, e)))
    }
}

/// Advisory bias from a previously successful configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHint {
    pub provider: Option<String>,
    pub version: Option<String>,
}

/// A delivered, not yet verified cell.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub capability: String,
    pub provider: String,
    pub descriptor: CellDescriptor,
}

/// Fans a capability request out over the configured providers.
pub struct RegistryClient {
    providers: Vec<Arc<dyn CapabilityProvider>>,
    request_timeout: Duration,
}

impl RegistryClient {
    pub fn new(providers: Vec<Arc<dyn CapabilityProvider>>, request_timeout: Duration) -> Self {
        info!("RegistryClient: {} providers configured", providers.len());
        Self {
            providers,
            request_timeout,
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    /// Providers eligible for one attempt, hinted provider first.
    fn ordered(&self, exclude: &HashSet<String>, hint: Option<&RequestHint>) -> Vec<Arc<dyn CapabilityProvider>> {
        let mut ordered: Vec<_> = self
            .providers
            .iter()
            .filter(|p| !exclude.contains(p.id()))
            .cloned()
            .collect();
        if let Some(preferred) = hint.and_then(|h| h.provider.as_deref()) {
            if let Some(pos) = ordered.iter().position(|p| p.id() == preferred) {
                let p = ordered.remove(pos);
                ordered.insert(0, p);
            }
        }
        ordered
    }

    /// Find one candidate cell for `requirement`, skipping providers in `exclude`.
    ///
    /// Each provider call is bounded by the request timeout. Returns
    /// [`Error::CapabilityUnavailable`] once every eligible provider has
    /// declined, failed or timed out.
    pub async fn find_candidate(
        &self,
        requirement: &CapabilityRequirement,
        quantum_signature: &str,
        context: &serde_json::Value,
        exclude: &HashSet<String>,
        hint: Option<&RequestHint>,
    ) -> Result<Candidate> {
        let mut reasons: Vec<String> = Vec::new();

        for provider in self.ordered(exclude, hint) {
            let request = CellRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                capability: requirement.name.clone(),
                version: requirement.version.clone(),
                quantum_signature: quantum_signature.to_string(),
                context: context.clone(),
                preferences: requirement.preferences.clone(),
                preferred_version: hint.and_then(|h| h.version.clone()),
            };

            let response =
                match tokio::time::timeout(self.request_timeout, provider.request_cell(&request)).await {
                    Ok(Ok(resp)) => resp,
                    Ok(Err(e)) => {
                        warn!("Provider {} failed for {}: {}", provider.id(), requirement.name, e);
                        reasons.push(format!("{}: {}", provider.id(), e));
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            "Provider {} timed out after {:?} for {}",
                            provider.id(),
                            self.request_timeout,
                            requirement.name
                        );
                        reasons.push(format!("{}: timed out", provider.id()));
                        continue;
                    }
                };

            match response.status {
                RequestStatus::Success => {
                    let Some(mut cell) = response.cell else {
                        reasons.push(format!("{}: success without a cell", provider.id()));
                        continue;
                    };
                    if cell.provider.is_empty() {
                        cell.provider = provider.id().to_string();
                    }
                    if !cell.capabilities.is_empty() && !cell.offers(&requirement.name) {
                        reasons.push(format!("{}: delivered cell lacks capability", provider.id()));
                        continue;
                    }
                    if !requirement.accepts_version(&cell.version) {
                        reasons.push(format!(
                            "{}: version {} does not satisfy {}",
                            provider.id(),
                            cell.version,
                            requirement.version
                        ));
                        continue;
                    }
                    debug!(
                        "Provider {} delivered {} for {}",
                        provider.id(),
                        cell.cell_id,
                        requirement.name
                    );
                    return Ok(Candidate {
                        capability: requirement.name.clone(),
                        provider: provider.id().to_string(),
                        descriptor: cell,
                    });
                }
                RequestStatus::Pending => reasons.push(format!("{}: pending", provider.id())),
                RequestStatus::NotFound => reasons.push(format!("{}: not found", provider.id())),
                RequestStatus::Error => {
                    let detail = response
                        .error
                        .map(|e| format!("{} {}", e.code, e.message))
                        .unwrap_or_else(|| "error".into());
                    reasons.push(format!("{}: {}", provider.id(), detail));
                }
            }
        }

        Err(Error::CapabilityUnavailable {
            capability: requirement.name.clone(),
            reason: if reasons.is_empty() {
                "no eligible providers".into()
            } else {
                reasons.join("; ")
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorBody;

    struct StaticProvider {
        id: String,
        capability: Option<&'static str>,
        version: &'static str,
        delay: Duration,
    }

    impl StaticProvider {
        fn offering(id: &str, capability: &'static str) -> Arc<dyn CapabilityProvider> {
            Arc::new(Self {
                id: id.into(),
                capability: Some(capability),
                version: "1.0.0",
                delay: Duration::ZERO,
            })
        }

        fn empty(id: &str) -> Arc<dyn CapabilityProvider> {
            Arc::new(Self {
                id: id.into(),
                capability: None,
                version: "1.0.0",
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl CapabilityProvider for StaticProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn request_cell(&self, request: &CellRequest) -> Result<ProviderResponse> {
            tokio::time::sleep(self.delay).await;
            match self.capability {
                Some(cap) if cap == request.capability => Ok(ProviderResponse::success(
                    &request.request_id,
                    CellDescriptor {
                        cell_id: format!("{}-{}", self.id, cap),
                        signature: String::new(),
                        download_url: format!("https://{}/cells/{}", self.id, cap),
                        capabilities: vec![cap.to_string()],
                        dependencies: vec![],
                        version: self.version.into(),
                        provider: String::new(),
                        resources: None,
                        requires: vec![],
                        provides: vec![],
                        control_url: None,
                    }
                    .signed(),
                )),
                Some(_) => Ok(ProviderResponse {
                    request_id: request.request_id.clone(),
                    status: RequestStatus::Error,
                    cell: None,
                    error: Some(ErrorBody {
                        code: "unsupported".into(),
                        message: "capability not offered".into(),
                    }),
                }),
                None => Ok(ProviderResponse::not_found(&request.request_id)),
            }
        }
    }

    fn ctx() -> serde_json::Value {
        serde_json::json!({})
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let client = RegistryClient::new(
            vec![
                StaticProvider::empty("alpha"),
                StaticProvider::offering("beta", "file_operations"),
            ],
            Duration::from_secs(1),
        );
        let req = CapabilityRequirement::new("file_operations");
        let candidate = client
            .find_candidate(&req, "qcsig", &ctx(), &HashSet::new(), None)
            .await
            .unwrap();
        assert_eq!(candidate.provider, "beta");
        assert_eq!(candidate.descriptor.provider, "beta");
    }

    #[tokio::test]
    async fn test_exclusion_and_unavailable() {
        let client = RegistryClient::new(
            vec![StaticProvider::offering("beta", "file_operations")],
            Duration::from_secs(1),
        );
        let req = CapabilityRequirement::new("file_operations");
        let exclude: HashSet<String> = ["beta".to_string()].into_iter().collect();
        let err = client
            .find_candidate(&req, "qcsig", &ctx(), &exclude, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityUnavailable { .. }));

        let err = client
            .find_candidate(&CapabilityRequirement::new("media"), "qcsig", &ctx(), &HashSet::new(), None)
            .await
            .unwrap_err();
        match err {
            Error::CapabilityUnavailable { capability, reason } => {
                assert_eq!(capability, "media");
                assert!(reason.contains("unsupported"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hint_reorders_providers() {
        let client = RegistryClient::new(
            vec![
                StaticProvider::offering("alpha", "file_operations"),
                StaticProvider::offering("beta", "file_operations"),
            ],
            Duration::from_secs(1),
        );
        let hint = RequestHint {
            provider: Some("beta".into()),
            version: None,
        };
        let candidate = client
            .find_candidate(
                &CapabilityRequirement::new("file_operations"),
                "qcsig",
                &ctx(),
                &HashSet::new(),
                Some(&hint),
            )
            .await
            .unwrap();
        assert_eq!(candidate.provider, "beta");
    }

    #[tokio::test]
    async fn test_version_constraint_and_timeout() {
        let slow: Arc<dyn CapabilityProvider> = Arc::new(StaticProvider {
            id: "slow".into(),
            capability: Some("file_operations"),
            version: "2.0.0",
            delay: Duration::from_millis(200),
        });
        let client = RegistryClient::new(
            vec![slow, StaticProvider::offering("old", "file_operations")],
            Duration::from_millis(20),
        );
        let req = CapabilityRequirement::new("file_operations").with_version("^2");
        let err = client
            .find_candidate(&req, "qcsig", &ctx(), &HashSet::new(), None)
            .await
            .unwrap_err();
        match err {
            Error::CapabilityUnavailable { reason, .. } => {
                assert!(reason.contains("slow: timed out"));
                assert!(reason.contains("does not satisfy ^2"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
