//! Reading endpoint and region hints out of backend error responses

/// Text of the first `<tag>...</tag>` element in an XML error body.
pub fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    let value = body[start..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Region quoted in messages like
/// `the region 'us-east-1' is wrong; expecting 'eu-west-1'`.
pub fn region_from_message(message: &str) -> Option<String> {
    let start = message.find("expecting '")? + "expecting '".len();
    let end = message[start..].find('\'')? + start;
    let region = message[start..end].trim();
    if region.is_empty() {
        None
    } else {
        Some(region.to_string())
    }
}

fn looks_like_region(label: &str) -> bool {
    label.contains('-') && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Region embedded in an AWS-style host: `s3.eu-west-1.amazonaws.com`,
/// `bucket.s3.dualstack.eu-west-1.amazonaws.com` or the legacy
/// `s3-eu-west-1.amazonaws.com`.
pub fn region_from_host(host: &str) -> Option<String> {
    let host = host_only(host);
    let labels: Vec<&str> = host.split('.').collect();
    for (i, label) in labels.iter().enumerate() {
        if *label == "s3" {
            let mut next = labels.get(i + 1).copied()?;
            if next == "dualstack" {
                next = labels.get(i + 2).copied()?;
            }
            if looks_like_region(next) {
                return Some(next.to_string());
            }
            return None;
        }
        if let Some(region) = label.strip_prefix("s3-") {
            if looks_like_region(region) && !region.starts_with("website") {
                return Some(region.to_string());
            }
        }
    }
    None
}

/// Strip scheme, path and port from an endpoint or host string.
pub fn host_only(endpoint: &str) -> &str {
    let endpoint = endpoint.trim();
    let without_scheme = match endpoint.split_once("://") {
        Some((_, rest)) => rest,
        None => endpoint,
    };
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port.split(':').next().unwrap_or(host_port)
}

/// `scheme://host[:port]` for a suggested host. A hint that already carries a
/// scheme is kept as is.
pub fn endpoint_url_for(host: &str, scheme: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("{}://{}", scheme, host)
    }
}

/// Which bucket, if any, a virtual-hosted hostname is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostBinding {
    /// The host starts with the requested bucket
    Requested,
    /// The host is bound to this other bucket
    Other(String),
    /// A plain service endpoint
    Unbound,
}

fn is_service_label(label: &str) -> bool {
    label == "s3" || label.starts_with("s3-")
}

/// Whether `rest` (a host with its leftmost label removed) is itself a
/// service endpoint: the root endpoint, a sibling of it, or a regional host.
fn is_service_remainder(rest: &[&str], root_host: &str) -> bool {
    if rest.len() < 2 {
        return false;
    }
    let joined = rest.join(".");
    if !root_host.is_empty() {
        if joined == root_host {
            return true;
        }
        let root_labels = root_host.split('.').count();
        if let Some((_, root_parent)) = root_host.split_once('.') {
            if root_parent.contains('.') && rest.len() >= root_labels && joined.ends_with(&format!(".{}", root_parent)) {
                return true;
            }
        }
    }
    rest.len() >= 3 && looks_like_region(rest[0])
}

/// Classify `host` against the bucket the caller asked for. `root_host` is
/// the host of the profile endpoint, empty for the provider default.
///
/// Bucket names may themselves contain dots, so the requested bucket is
/// matched as a host prefix. Another bucket is recognised in front of an
/// `s3` service label, or as the leftmost label of a host whose remainder is
/// a service endpoint (`other.eu-west.example.com`).
pub fn classify_host(host: &str, bucket: &str, root_host: &str) -> HostBinding {
    let host = host_only(host).to_ascii_lowercase();
    let bucket = bucket.to_ascii_lowercase();
    let root_host = host_only(root_host).to_ascii_lowercase();
    if !bucket.is_empty() && host.starts_with(&format!("{}.", bucket)) {
        return HostBinding::Requested;
    }
    let labels: Vec<&str> = host.split('.').collect();
    match labels.iter().position(|l| is_service_label(l)) {
        Some(pos) if pos > 0 => return HostBinding::Other(labels[..pos].join(".")),
        Some(_) => return HostBinding::Unbound,
        None => {}
    }
    if host == root_host {
        return HostBinding::Unbound;
    }
    match labels.split_first() {
        Some((first, rest)) if is_service_remainder(rest, &root_host) => HostBinding::Other(first.to_string()),
        _ => HostBinding::Unbound,
    }
}

/// Endpoint to hand the SDK for a virtual-style client whose host already
/// starts with `bucket`: the SDK prepends the bucket label itself.
pub fn strip_bucket_label(endpoint_url: &str, bucket: &str) -> Option<String> {
    let (scheme, rest) = endpoint_url.split_once("://")?;
    let prefix = format!("{}.", bucket);
    let stripped = rest.strip_prefix(&prefix)?;
    if stripped.is_empty() {
        return None;
    }
    Some(format!("{}://{}", scheme, stripped))
}
