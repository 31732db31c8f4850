//! Provider ID codec
//!
//! The host cluster stores `dvp://<vm-name>` in `node.spec.providerID`. The
//! value must stay stable for the lifetime of the VM, so encoding is plain
//! formatting and decoding accepts exactly one grammar.

use crate::Error;

/// Name this provider registers under and the scheme of its provider IDs
pub const PROVIDER_NAME: &str = "dvp";

/// Build the provider ID for a virtual machine
pub fn provider_id(instance_name: &str) -> String {
    format!("{}://{}", PROVIDER_NAME, instance_name)
}

/// Extract the virtual machine name from a provider ID
///
/// Accepts `dvp://` followed by one or more of `[0-9A-Za-z_-]`.
pub fn parse_provider_id(provider_id: &str) -> Result<&str, Error> {
    provider_id
        .strip_prefix(PROVIDER_NAME)
        .and_then(|rest| rest.strip_prefix("://"))
        .filter(|token| is_valid_token(token))
        .ok_or_else(|| Error::InvalidProviderId {
            provider_id: provider_id.to_string(),
            expected: PROVIDER_NAME,
        })
}

fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
