use crate::errors::ProxyError;
use crate::types::{RoutingConfig, RoutingMode, Target};

/// Picks the target serving `path`.
///
/// Among active targets whose `path_prefix` is a literal prefix of `path`, the longest
/// prefix wins; equal lengths go to the target listed first. Direct configs have a single
/// target, which matches when active.
pub fn select<'a>(config: &'a RoutingConfig, path: &str) -> Result<&'a Target, ProxyError> {
    let selected = match &config.mode {
        RoutingMode::Direct(target) => target.active.then_some(target),
        RoutingMode::Tunnel(targets) => longest_prefix(targets, path),
    };

    match selected {
        Some(target) => {
            tracing::debug!(
                key_id = %config.id,
                target_id = %target.id,
                path_prefix = %target.path_prefix,
                "selected target"
            );
            Ok(target)
        }
        None => Err(ProxyError::NoMatchingTarget),
    }
}

fn longest_prefix<'a>(targets: &'a [Target], path: &str) -> Option<&'a Target> {
    let mut best: Option<&Target> = None;

    for target in targets
        .iter()
        .filter(|t| t.active && path.starts_with(t.path_prefix.as_str()))
    {
        // strictly longer only, so the earliest target keeps a tie
        if best.is_none_or(|b| target.path_prefix.len() > b.path_prefix.len()) {
            best = Some(target);
        }
    }

    best
}
