//! Proxmox tag conventions for managed VMs.
//!
//! Every VM the provider owns carries exactly one `ca-group-<group_id>` tag.
//! Other tags on the same VM are preserved but ignored.

const GROUP_TAG_PREFIX: &str = "ca-group-";

/// The tag that marks a VM as belonging to a node group.
pub fn group_tag(group_id: &str) -> String {
    format!("{}{}", GROUP_TAG_PREFIX, group_id)
}

/// Extract the group id from a managed tag, if it is one.
pub fn group_from_tag(tag: &str) -> Option<&str> {
    tag.strip_prefix(GROUP_TAG_PREFIX).filter(|g| !g.is_empty())
}

/// Split Proxmox's tag string (`;` or `,` separated) into a deduplicated list.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in raw.replace(',', ";").split(';') {
        let tag = part.trim();
        if tag.is_empty() || out.iter().any(|t| t == tag) {
            continue;
        }
        out.push(tag.to_string());
    }
    out
}
