use crate::requests::RequestCounts;

/// Badge text for the current pending counts. Site requests win over
/// metadata, then signing (shown as a number), then networks, then assets.
pub fn badge_text(counts: &RequestCounts) -> String {
    if counts.sites > 0 {
        "Sites".to_string()
    } else if counts.metadata > 0 {
        "Meta".to_string()
    } else if counts.signing > 0 {
        counts.signing.to_string()
    } else if counts.networks > 0 {
        "Network".to_string()
    } else if counts.evm_assets > 0 {
        "Assets".to_string()
    } else {
        String::new()
    }
}
