// src/bank.rs

use crate::error::ScanError;
use crate::store::ScanStore;
use tracing::info;

/// Canonical (display name, identifier) pair used as the join key for
/// rule sets and templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankIdentity {
    pub display_name: String,
    pub bank_id: String,
    /// The name as reported by the model or adopted from a historical
    /// account, before canonicalization.
    pub raw_name: String,
}

/// Outcome of identity resolution. Unresolved identity is a normal,
/// representable outcome, never an error.
#[derive(Debug, Clone)]
pub enum ResolvedBank {
    Identified(BankIdentity),
    Unidentified { warning: String },
}

/// Values the model emits when it cannot name the bank.
const UNKNOWN_SENTINELS: &[&str] = &["", "unknown", "n/a", "na", "none", "unidentified"];

/// Common shorthand the model produces for well-known institutions.
const ALIASES: &[(&str, &str)] = &[
    ("bofa", "Bank of America"),
    ("boa", "Bank of America"),
    ("bank of america na", "Bank of America"),
    ("jpmorgan chase", "Chase"),
    ("jp morgan chase", "Chase"),
    ("chase bank", "Chase"),
    ("wells fargo bank", "Wells Fargo"),
    ("citibank", "Citi"),
    ("capital one na", "Capital One"),
];

fn is_unknown(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    UNKNOWN_SENTINELS.contains(&lowered.as_str())
}

/// Canonicalize a raw bank name: collapse whitespace, resolve known
/// aliases, and fix single-case shouting/mumbling into title case.
pub fn normalize_name(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let key = collapsed.to_ascii_lowercase();

    if let Some((_, canonical)) = ALIASES.iter().find(|(alias, _)| *alias == key) {
        return canonical.to_string();
    }

    let single_case = collapsed == collapsed.to_uppercase() || collapsed == collapsed.to_lowercase();
    if single_case {
        collapsed
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        collapsed
    }
}

/// Machine-safe identifier derived from a display name.
pub fn bank_slug(display_name: &str) -> String {
    let mut slug = String::with_capacity(display_name.len());
    let mut last_dash = true;
    for c in display_name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn identify(raw_name: &str) -> BankIdentity {
    let display_name = normalize_name(raw_name);
    let bank_id = bank_slug(&display_name);
    BankIdentity {
        display_name,
        bank_id,
        raw_name: raw_name.trim().to_string(),
    }
}

/// Resolve the statement's bank identity.
///
/// Order: take the model's guess if it is not an unknown sentinel;
/// otherwise match the account number's last four characters against
/// the owner's historical accounts (most recently updated first) and
/// adopt that account's bank name; otherwise report no identity so the
/// caller can surface a "needs identification" condition.
pub fn resolve(
    store: &ScanStore,
    owner: &str,
    raw_name: Option<&str>,
    account_number: Option<&str>,
) -> Result<ResolvedBank, ScanError> {
    if let Some(raw) = raw_name {
        if !is_unknown(raw) {
            let identity = identify(raw);
            // A name with no sluggable characters yields an empty id;
            // distinct banks must never share a cache key, so treat it
            // as unresolved instead.
            if !identity.bank_id.is_empty() {
                info!(bank = %identity.display_name, id = %identity.bank_id, "Bank resolved from model guess");
                return Ok(ResolvedBank::Identified(identity));
            }
            info!(raw = %raw, "Bank name has no machine-safe identifier");
        }
    }

    if let Some(number) = account_number {
        let digits: Vec<char> = number.trim().chars().collect();
        if digits.len() >= 4 {
            let suffix: String = digits[digits.len() - 4..].iter().collect();
            let accounts = store.find_accounts_by_owner(owner)?;
            if let Some(hit) = accounts.iter().find(|a| a.account_suffix == suffix) {
                let identity = identify(&hit.bank_name);
                if !identity.bank_id.is_empty() {
                    info!(
                        bank = %identity.display_name,
                        suffix = %suffix,
                        "Bank adopted from historical account with matching suffix"
                    );
                    return Ok(ResolvedBank::Identified(identity));
                }
            }
        }
    }

    info!("Bank identity could not be resolved");
    Ok(ResolvedBank::Unidentified {
        warning: "Bank could not be identified from this document. Please select the bank manually."
            .to_string(),
    })
}
