//! Connection binder: finds a client that can actually talk to a bucket.
//!
//! S3-compatible backends disagree about regions and addressing styles, so a
//! bucket is bound by probing candidate `(endpoint, region, style)` triples
//! with a one-key listing. Only a successful probe changes state; a failed
//! [`ConnectionBinder::bind_bucket`] leaves the previous binding in place.

use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::config::{AddressingStyle, ConfigOverrides, ConnectionConfig, DEFAULT_SIGNING_REGION};
use crate::error::{BindingError, StoreError};
use crate::providers::hints::{classify_host, endpoint_url_for, region_from_host, HostBinding};
use crate::providers::{BucketSummary, ClientFactory, ClientSpec, ListRequest, StorageBackend};

/// Upper bound on signing regions tried by [`ConnectionBinder::list_accessible_buckets`]
pub const MAX_REGION_ATTEMPTS: usize = 10;

/// Upper bound on probes per [`ConnectionBinder::bind_bucket`] call
pub const MAX_BIND_PROBES: usize = 8;

/// A bucket plus the client that was proven to reach it.
#[derive(Clone)]
pub struct BucketHandle {
    pub bucket: String,
    pub client: Arc<dyn StorageBackend>,
}

impl fmt::Debug for BucketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketHandle")
            .field("bucket", &self.bucket)
            .field("endpoint_url", &self.client.spec().endpoint_url)
            .finish()
    }
}

/// The last successfully probed combination for the active bucket.
#[derive(Clone)]
pub struct BucketBinding {
    pub bucket: String,
    pub endpoint_url: String,
    pub region: String,
    pub addressing_style: AddressingStyle,
    client: Arc<dyn StorageBackend>,
}

impl BucketBinding {
    pub fn client(&self) -> Arc<dyn StorageBackend> {
        self.client.clone()
    }

    pub fn handle(&self) -> BucketHandle {
        BucketHandle {
            bucket: self.bucket.clone(),
            client: self.client.clone(),
        }
    }
}

impl fmt::Debug for BucketBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketBinding")
            .field("bucket", &self.bucket)
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("addressing_style", &self.addressing_style)
            .finish()
    }
}

impl PartialEq for BucketBinding {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket
            && self.endpoint_url == other.endpoint_url
            && self.region == other.region
            && self.addressing_style == other.addressing_style
            && Arc::ptr_eq(&self.client, &other.client)
    }
}

/// Where a redirect pointed us.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Suggestion {
    host: Option<String>,
    region: Option<String>,
}

/// One probe target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Candidate {
    endpoint_url: String,
    region: String,
    style: AddressingStyle,
}

pub struct ConnectionBinder {
    factory: Arc<dyn ClientFactory>,
    profile: ConnectionConfig,
    binding: Option<BucketBinding>,
    root_client: Option<Arc<dyn StorageBackend>>,
}

impl ConnectionBinder {
    pub fn new(profile: ConnectionConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            profile,
            binding: None,
            root_client: None,
        }
    }

    pub fn profile(&self) -> &ConnectionConfig {
        &self.profile
    }

    pub fn binding(&self) -> Option<&BucketBinding> {
        self.binding.as_ref()
    }

    /// Binding for `bucket`, if that is the bound bucket.
    pub fn binding_for(&self, bucket: &str) -> Option<&BucketBinding> {
        self.binding.as_ref().filter(|b| b.bucket == bucket)
    }

    /// Swap credentials/endpoint; every cached client is dropped.
    pub fn set_profile(&mut self, profile: ConnectionConfig) {
        info!("set_profile: endpoint={}", profile.endpoint_url);
        self.profile = profile;
        self.binding = None;
        self.root_client = None;
    }

    /// Region requests are currently signed with.
    pub fn current_region(&self) -> String {
        match &self.binding {
            Some(binding) => binding.region.clone(),
            None => self.profile.signing_region().to_string(),
        }
    }

    /// Build a client from the profile with `overrides` applied. No I/O.
    pub fn build_client(&self, overrides: &ConfigOverrides) -> Result<Arc<dyn StorageBackend>, StoreError> {
        let config = self.profile.merged(overrides);
        self.factory.build(&ClientSpec::from_config(&config))
    }

    /// Client for the root (non bucket-scoped) endpoint, built on first use.
    pub fn root_client(&mut self) -> Result<Arc<dyn StorageBackend>, StoreError> {
        if let Some(client) = &self.root_client {
            return Ok(client.clone());
        }
        let client = self.build_client(&ConfigOverrides::default())?;
        self.root_client = Some(client.clone());
        Ok(client)
    }

    /// Leave the bucket: drop its binding and the cached root client so the
    /// next bucket-list call signs with the profile settings again.
    pub fn return_to_root_scope(&mut self) {
        if let Some(binding) = self.binding.take() {
            info!("return_to_root_scope: leaving {}", binding.bucket);
        }
        self.root_client = None;
    }

    fn candidate_spec(&self, bucket: &str, candidate: &Candidate) -> ClientSpec {
        let mut spec = ClientSpec::from_config(&self.profile).for_bucket(bucket);
        spec.endpoint_url = candidate.endpoint_url.clone();
        spec.region = candidate.region.clone();
        spec.addressing_style = candidate.style;
        spec
    }

    async fn probe(&self, bucket: &str, candidate: &Candidate) -> Result<BucketBinding, StoreError> {
        debug!(
            "bind_probe: bucket={} endpoint={} region={} style={}",
            bucket, candidate.endpoint_url, candidate.region, candidate.style
        );
        let client = self.factory.build(&self.candidate_spec(bucket, candidate))?;
        client
            .list_objects(&ListRequest::new(bucket, "").max_keys(1))
            .await?;
        Ok(BucketBinding {
            bucket: bucket.to_string(),
            endpoint_url: candidate.endpoint_url.clone(),
            region: candidate.region.clone(),
            addressing_style: candidate.style,
            client,
        })
    }

    /// Candidates to try for one redirect suggestion.
    fn suggestion_candidates(
        &self,
        bucket: &str,
        suggestion: &Suggestion,
        base_region: &str,
    ) -> Result<Vec<Candidate>, BindingError> {
        let style = self.profile.addressing_style;
        let Some(host) = &suggestion.host else {
            // Region-only hint: same endpoint, both styles.
            let region = suggestion.region.clone().unwrap_or_else(|| base_region.to_string());
            return Ok([style, style.opposite()]
                .into_iter()
                .map(|style| Candidate {
                    endpoint_url: self.profile.endpoint_url.clone(),
                    region: region.clone(),
                    style,
                })
                .collect());
        };

        let endpoint_url = endpoint_url_for(host, self.profile.endpoint_scheme());
        let region = suggestion
            .region
            .clone()
            .or_else(|| region_from_host(host))
            .unwrap_or_else(|| base_region.to_string());

        let styles = match classify_host(host, bucket, &self.profile.endpoint_url) {
            HostBinding::Other(found) => {
                warn!("bind_mismatch: bucket={} endpoint={} serves={}", bucket, host, found);
                return Err(BindingError::BucketMismatch {
                    requested: bucket.to_string(),
                    found,
                    endpoint: host.clone(),
                });
            }
            HostBinding::Requested => vec![AddressingStyle::Virtual],
            HostBinding::Unbound => vec![style, style.opposite()],
        };

        Ok(styles
            .into_iter()
            .map(|style| Candidate {
                endpoint_url: endpoint_url.clone(),
                region: region.clone(),
                style,
            })
            .collect())
    }

    /// Probe until a client reaches `bucket`, then commit it as the binding.
    ///
    /// Order: current endpoint with the configured style, then the opposite
    /// style, then whatever redirect responses suggested. Non-redirect errors
    /// end the search immediately.
    pub async fn bind_bucket(&mut self, bucket: &str) -> Result<&BucketBinding, BindingError> {
        let style = self.profile.addressing_style;
        let base_region = match self.binding_for(bucket) {
            Some(binding) => binding.region.clone(),
            None => self.profile.signing_region().to_string(),
        };

        let mut queue: VecDeque<Candidate> = [style, style.opposite()]
            .into_iter()
            .map(|style| Candidate {
                endpoint_url: self.profile.endpoint_url.clone(),
                region: base_region.clone(),
                style,
            })
            .collect();
        let mut tried: HashSet<Candidate> = HashSet::new();
        let mut suggestions: Vec<Suggestion> = Vec::new();
        let mut pending: VecDeque<Suggestion> = VecDeque::new();
        let mut last_error: Option<StoreError> = None;
        let mut probes = 0;

        loop {
            let Some(candidate) = queue.pop_front() else {
                // Direct candidates used up: expand the next redirect suggestion.
                let Some(suggestion) = pending.pop_front() else {
                    break;
                };
                queue.extend(self.suggestion_candidates(bucket, &suggestion, &base_region)?);
                continue;
            };

            if !tried.insert(candidate.clone()) {
                continue;
            }
            if probes >= MAX_BIND_PROBES {
                break;
            }
            probes += 1;

            match self.probe(bucket, &candidate).await {
                Ok(binding) => {
                    info!(
                        "bind_bucket: bucket={} endpoint={} region={} style={}",
                        bucket, binding.endpoint_url, binding.region, binding.addressing_style
                    );
                    return Ok(self.binding.insert(binding));
                }
                Err(err) if err.is_redirect_class() => {
                    let suggestion = Suggestion {
                        host: err.redirect_endpoint().map(str::to_string),
                        region: err.expected_region().map(str::to_string),
                    };
                    debug!("bind_redirect: {} -> {:?}", candidate.endpoint_url, suggestion);
                    if (suggestion.host.is_some() || suggestion.region.is_some()) && !suggestions.contains(&suggestion) {
                        suggestions.push(suggestion.clone());
                        pending.push_back(suggestion);
                    }
                    last_error = Some(err);
                }
                Err(err) => {
                    warn!("bind_bucket: bucket={} failed: {}", bucket, err);
                    return Err(BindingError::Backend(err));
                }
            }
        }

        let source = last_error.unwrap_or_else(|| StoreError::InvalidConfig {
            message: format!("no endpoint candidates for bucket {}", bucket),
        });
        warn!("bind_bucket: bucket={} exhausted: {}", bucket, source);
        Err(BindingError::Exhausted {
            bucket: bucket.to_string(),
            source,
            suggested_endpoint: suggestions.into_iter().find_map(|s| s.host),
        })
    }

    /// Candidate promoted by a successful retry with `region`. Not committed
    /// until [`ConnectionBinder::promote`].
    pub fn rebind_region(&self, region: &str) -> Result<BucketBinding, StoreError> {
        let binding = self.binding.as_ref().ok_or_else(|| StoreError::InvalidConfig {
            message: "no bucket bound".to_string(),
        })?;
        let candidate = Candidate {
            endpoint_url: binding.endpoint_url.clone(),
            region: region.to_string(),
            style: binding.addressing_style,
        };
        let client = self.factory.build(&self.candidate_spec(&binding.bucket, &candidate))?;
        Ok(BucketBinding {
            bucket: binding.bucket.clone(),
            endpoint_url: candidate.endpoint_url,
            region: candidate.region,
            addressing_style: candidate.style,
            client,
        })
    }

    /// Commit a binding proven by [`ConnectionBinder::rebind_region`]. Ignored
    /// if the bound bucket changed in the meantime.
    pub fn promote(&mut self, binding: BucketBinding) {
        match &self.binding {
            Some(current) if current.bucket == binding.bucket => {
                info!(
                    "region_promote: bucket={} {} -> {}",
                    binding.bucket, current.region, binding.region
                );
                self.binding = Some(binding);
            }
            _ => debug!("region_promote: bucket {} no longer bound", binding.bucket),
        }
    }

    /// List buckets against the root endpoint, hopping signing regions when
    /// the backend names the one it expects.
    pub async fn list_accessible_buckets(&self) -> Result<Vec<BucketSummary>, StoreError> {
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();
        let seeds = [
            Some(DEFAULT_SIGNING_REGION.to_string()),
            self.profile.known_region().map(str::to_string),
            Some(self.current_region()),
        ];
        for region in seeds.into_iter().flatten() {
            if seen.insert(region.clone()) {
                queue.push_back(region);
            }
        }

        let mut last_error: Option<StoreError> = None;
        let mut attempts = 0;
        while let Some(region) = queue.pop_front() {
            if attempts >= MAX_REGION_ATTEMPTS {
                break;
            }
            attempts += 1;

            let client = self.build_client(&ConfigOverrides {
                region: Some(region.clone()),
                ..Default::default()
            })?;
            match client.list_buckets().await {
                Ok(buckets) => {
                    debug!("list_buckets: region={} count={}", region, buckets.len());
                    return Ok(buckets);
                }
                Err(err) if err.is_redirect_class() => {
                    warn!("list_buckets: region={} rejected: {}", region, err);
                    if let Some(expected) = err.expected_region() {
                        if seen.insert(expected.to_string()) {
                            queue.push_back(expected.to_string());
                        }
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::InvalidConfig {
            message: "no signing region left to try".to_string(),
        }))
    }
}
