use anyhow::{Context, Result, anyhow};
use lxm_core::{CommandRunner, StaticLease};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Delimiters of the only region of the dnsmasq config this engine is
/// allowed to rewrite. Everything outside them is owned by the host
/// administrator and must survive byte-for-byte.
pub const BLOCK_BEGIN: &str = "# BEGIN LXM MANAGED LEASES - do not edit inside this block";
pub const BLOCK_END: &str = "# END LXM MANAGED LEASES";

/// Render the managed block body for a desired lease set. Sorted by
/// container name so the output is deterministic and diffs cleanly.
pub fn render_block(leases: &[StaticLease]) -> Vec<String> {
    let mut leases: Vec<&StaticLease> = leases.iter().collect();
    leases.sort_by(|a, b| a.container_name.cmp(&b.container_name));
    leases.iter().map(|l| l.config_line()).collect()
}

/// Extract the current managed block body, empty when no block exists
/// yet. A BEGIN marker without its END is corruption this engine will
/// not write through.
pub fn extract_block(content: &str) -> Result<Vec<String>> {
    let mut inside = false;
    let mut lines = vec![];
    for line in content.lines() {
        match (inside, line.trim()) {
            (false, l) if l == BLOCK_BEGIN => inside = true,
            (true, l) if l == BLOCK_END => inside = false,
            (true, l) if !l.is_empty() => lines.push(l.to_string()),
            _ => {}
        }
    }
    if inside {
        return Err(anyhow!(
            "managed block is unterminated (BEGIN marker without END)"
        ));
    }
    Ok(lines)
}

/// Replace the managed block body with `block`, leaving every other
/// line untouched. When no block exists yet one is appended at the end
/// of the file without touching the bytes of the preceding content.
pub fn splice_block(content: &str, block: &[String]) -> Result<String> {
    // Validates marker pairing up front.
    let _ = extract_block(content)?;

    if !content.lines().any(|l| l.trim() == BLOCK_BEGIN) {
        let mut out = content.to_string();
        // The markers need their own lines.
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        append_block(&mut out, block);
        return Ok(out);
    }

    let mut out = String::new();
    let mut inside = false;

    for line in content.lines() {
        if line.trim() == BLOCK_BEGIN {
            inside = true;
            append_block(&mut out, block);
            continue;
        }
        if line.trim() == BLOCK_END {
            inside = false;
            continue;
        }
        if !inside {
            out.push_str(line);
            out.push('\n');
        }
    }

    Ok(out)
}

fn append_block(out: &mut String, block: &[String]) {
    out.push_str(BLOCK_BEGIN);
    out.push('\n');
    for entry in block {
        out.push_str(entry);
        out.push('\n');
    }
    out.push_str(BLOCK_END);
    out.push('\n');
}

/// Parse the managed block back into `(mac, name, ip)` tuples, for
/// lease diagnostics.
pub fn parse_block(content: &str) -> Result<Vec<(String, String, Ipv4Addr)>> {
    let mut entries = vec![];
    for line in extract_block(content)? {
        let Some(rest) = line.strip_prefix("dhcp-host=") else {
            continue;
        };
        let parts: Vec<&str> = rest.split(',').collect();
        if parts.len() != 3 {
            continue;
        }
        let ip: Ipv4Addr = parts[2]
            .trim()
            .parse()
            .with_context(|| format!("bad lease address in line '{}'", line))?;
        entries.push((parts[0].trim().to_string(), parts[1].trim().to_string(), ip));
    }
    Ok(entries)
}

/// Reload seam for the DHCP service (`systemctl reload <unit>`).
pub struct DhcpService {
    runner: Arc<dyn CommandRunner>,
    unit: String,
}

impl DhcpService {
    pub fn new(runner: Arc<dyn CommandRunner>, unit: impl Into<String>) -> Self {
        Self {
            runner,
            unit: unit.into(),
        }
    }

    pub async fn reload(&self) -> Result<()> {
        let out = self
            .runner
            .run("systemctl", &["reload", &self.unit])
            .await
            .with_context(|| format!("failed to run systemctl reload {}", self.unit))?;
        if !out.success() {
            return Err(anyhow!(
                "{} rejected reload: {}",
                self.unit,
                out.error_text()
            ));
        }
        tracing::debug!(unit = %self.unit, "dhcp service reloaded");
        Ok(())
    }
}
