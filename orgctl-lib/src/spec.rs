//! Account spec language
//!
//! An account spec is a comma-separated list of entries that selects accounts
//! from the registry:
//!
//! ```text
//! entry := ["!"] name [["!"] "=" value]
//! ```
//!
//! A spec is evaluated in one of two modes.
//!
//! **Static** specs list account IDs (all 12 digits) or account names. Every
//! entry must match at least one account and negation is not allowed. IDs and
//! names cannot be mixed.
//!
//! **Dynamic** specs list tags. An account matches when it carries every
//! positive tag and none of the negated ones. Accounts without a valid control
//! record never match; accounts in an error state match only if `err` is
//! present.
//!
//! Two reserved names apply in both modes:
//!
//! - `owner` / `!owner` select owned / free accounts
//! - `owner=X` selects accounts owned by any of the listed X, `owner!=X`
//!   excludes accounts owned by X; `me` stands for the caller's session name
//! - `err` includes accounts whose access or control state failed
//!
//! Any other `name=value` pair must have a boolean value (`1 t T true TRUE
//! True` or `0 f F false FALSE False`); a false value negates the entry.
//!
//! Whether a list of words is a static name list or a tag list depends on the
//! registry: if any word is the name of a known account, the account spec is static.

use crate::account::{Account, AccountId};
use crate::ctl::{valid_tag, Ctl};
use crate::error::SpecError;
use std::sync::Arc;

/// Maximum number of distinct tags in one spec.
pub const MAX_TAGS: usize = 64;

const OWNER: &str = "owner";
const ERR: &str = "err";
const ME: &str = "me";

/// Parse a boolean entry value.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    word: String,
    neg: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    /// Only reserved entries (or nothing at all)
    Any,
    Ids(Vec<Entry>),
    Words(Vec<Entry>),
}

/// Owner predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OwnerFilter {
    owned: Option<bool>,
    is: Vec<String>,
    is_not: Vec<String>,
}

impl OwnerFilter {
    fn is_empty(&self) -> bool {
        self.owned.is_none() && self.is.is_empty() && self.is_not.is_empty()
    }

    fn matches(&self, ctl: &Ctl) -> bool {
        let owner = ctl.owner();
        if self.owned.is_some_and(|want| want != owner.is_some()) {
            return false;
        }
        if !self.is.is_empty() && !owner.is_some_and(|o| self.is.iter().any(|x| x == o)) {
            return false;
        }
        !owner.is_some_and(|o| self.is_not.iter().any(|x| x == o))
    }
}

/// Compiled tag condition: bit `i` of an account's mask is set when it has
/// `tags[i]`; the account matches when its mask equals `want`.
#[derive(Debug)]
struct TagMask {
    tags: Vec<String>,
    want: u64,
}

impl TagMask {
    fn compile(entries: &[Entry]) -> Result<Self, SpecError> {
        let mut tags: Vec<String> = Vec::new();
        let mut want = 0u64;
        for e in entries {
            if !valid_tag(&e.word) {
                return Err(SpecError::invalid(&e.word, "not a valid tag"));
            }
            let bit = match tags.iter().position(|t| t == &e.word) {
                Some(i) => i,
                None => {
                    if tags.len() == MAX_TAGS {
                        return Err(SpecError::TooManyTags(MAX_TAGS));
                    }
                    tags.push(e.word.clone());
                    tags.len() - 1
                }
            };
            if e.neg {
                want &= !(1 << bit);
            } else {
                want |= 1 << bit;
            }
        }
        Ok(Self { tags, want })
    }

    fn matches(&self, ctl: &Ctl) -> bool {
        let have = self
            .tags
            .iter()
            .enumerate()
            .filter(|(_, t)| ctl.has_tag(t))
            .fold(0u64, |m, (i, _)| m | (1 << i));
        have == self.want
    }
}

/// Parsed account spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    select: Selector,
    owner: OwnerFilter,
    include_err: bool,
}

impl AccountSpec {
    /// Parse `spec`. `me` is the caller's session name, substituted for the
    /// `me` owner value.
    pub fn parse(spec: &str, me: &str) -> Result<Self, SpecError> {
        let mut ids = Vec::new();
        let mut words = Vec::new();
        let mut owner = OwnerFilter::default();
        let mut include_err = false;

        for raw in spec.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (mut neg, rest) = match raw.strip_prefix('!') {
                Some(r) => (true, r),
                None => (false, raw),
            };
            let (name, value) = match rest.split_once('=') {
                Some((n, v)) => match n.strip_suffix('!') {
                    Some(n) => {
                        neg = !neg;
                        (n.trim(), Some(v.trim()))
                    }
                    None => (n.trim(), Some(v.trim())),
                },
                None => (rest.trim(), None),
            };
            if name.is_empty() {
                return Err(SpecError::invalid(raw, "missing name"));
            }
            if name.contains('!') {
                return Err(SpecError::invalid(raw, "misplaced '!'"));
            }

            // Boolean values fold into the negation flag; anything else is
            // only meaningful for owner.
            let mut text = None;
            if let Some(v) = value {
                match parse_bool(v) {
                    Some(b) => neg ^= !b,
                    None if name == OWNER => text = Some(v),
                    None => return Err(SpecError::invalid(raw, "value must be a boolean")),
                }
            }

            match name {
                OWNER => match text {
                    None => owner.owned = Some(!neg),
                    Some("") => return Err(SpecError::invalid(raw, "empty owner")),
                    Some(v) => {
                        let v = if v == ME { me } else { v };
                        if neg {
                            owner.is_not.push(v.to_string());
                        } else {
                            owner.is.push(v.to_string());
                        }
                    }
                },
                ERR if value.is_some() => return Err(SpecError::invalid(raw, "err takes no value")),
                ERR => include_err = !neg,
                _ => {
                    let entry = Entry {
                        word: name.to_string(),
                        neg,
                    };
                    if AccountId::is_valid(name) {
                        ids.push(entry);
                    } else {
                        words.push(entry);
                    }
                }
            }
        }

        let select = match (ids.is_empty(), words.is_empty()) {
            (true, true) => Selector::Any,
            (false, true) => Selector::Ids(ids),
            (true, false) => Selector::Words(words),
            (false, false) => return Err(SpecError::MixedEntries(words[0].word.clone())),
        };
        Ok(Self {
            select,
            owner,
            include_err,
        })
    }

    /// True for a spec without any entries, which selects everything.
    pub fn is_all(&self) -> bool {
        self.select == Selector::Any && self.owner.is_empty() && !self.include_err
    }

    /// Select matching accounts, keeping the input order.
    pub fn filter(&self, accounts: &[Arc<Account>]) -> Result<Vec<Arc<Account>>, SpecError> {
        if self.is_all() {
            return Ok(accounts.to_vec());
        }
        match &self.select {
            Selector::Ids(entries) => self.filter_static(accounts, entries, |a| a.id().to_string(), SpecError::UnknownId),
            Selector::Words(entries) if is_name_list(accounts, entries) => {
                self.filter_static(accounts, entries, |a| a.name(), SpecError::UnknownName)
            }
            Selector::Words(entries) => {
                let mask = TagMask::compile(entries)?;
                Ok(self.filter_dynamic(accounts, Some(&mask)))
            }
            Selector::Any => Ok(self.filter_dynamic(accounts, None)),
        }
    }

    fn filter_static(
        &self,
        accounts: &[Arc<Account>],
        entries: &[Entry],
        key: impl Fn(&Account) -> String,
        unknown: impl Fn(String) -> SpecError,
    ) -> Result<Vec<Arc<Account>>, SpecError> {
        if let Some(e) = entries.iter().find(|e| e.neg) {
            return Err(SpecError::IllegalNegation(e.word.clone()));
        }
        let keys: Vec<String> = accounts.iter().map(|a| key(a)).collect();
        if let Some(e) = entries.iter().find(|e| !keys.contains(&e.word)) {
            return Err(unknown(e.word.clone()));
        }
        Ok(accounts
            .iter()
            .zip(&keys)
            .filter(|(_, k)| entries.iter().any(|e| &e.word == *k))
            .filter(|(a, _)| self.owner_matches(a))
            .map(|(a, _)| a.clone())
            .collect())
    }

    fn owner_matches(&self, acct: &Account) -> bool {
        if self.owner.is_empty() {
            return true;
        }
        acct.ctl().is_some_and(|c| self.owner.matches(&c))
    }

    fn filter_dynamic(&self, accounts: &[Arc<Account>], tags: Option<&TagMask>) -> Vec<Arc<Account>> {
        accounts
            .iter()
            .filter(|a| {
                let s = a.state();
                if s.err.is_some() {
                    return self.include_err;
                }
                let Some(ctl) = s.ctl.as_ref().filter(|_| s.status.ctl_valid) else {
                    return false;
                };
                self.owner.matches(ctl) && tags.map_or(true, |m| m.matches(ctl))
            })
            .cloned()
            .collect()
    }
}

fn is_name_list(accounts: &[Arc<Account>], entries: &[Entry]) -> bool {
    let names: Vec<String> = accounts.iter().map(|a| a.name()).collect();
    entries.iter().any(|e| names.contains(&e.word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::{Creds, Provider};
    use crate::{OrgError, SpecError};

    fn account(n: u64, name: &str, ctl: Option<Ctl>) -> Arc<Account> {
        let id = AccountId::parse(&format!("{n:012}")).unwrap();
        let a = Account::new(id, name, Arc::new(Provider::fixed(Creds::permanent("k", "s"))));
        if let Some(c) = ctl {
            a.update(|s| s.set_confirmed(c));
        }
        Arc::new(a)
    }

    fn ctl(owner: &str, tags: &[&str]) -> Ctl {
        Ctl::new().with_owner(owner).with_tags(tags.iter().copied()).unwrap()
    }

    fn ids(accts: &[Arc<Account>]) -> Vec<String> {
        accts.iter().map(|a| a.id().to_string()).collect()
    }

    fn select(spec: &str, accts: &[Arc<Account>]) -> Result<Vec<String>, SpecError> {
        AccountSpec::parse(spec, "alice")?.filter(accts).map(|v| ids(&v))
    }

    #[test]
    fn bool_literals() {
        for t in ["1", "t", "T", "true", "TRUE", "True"] {
            assert_eq!(parse_bool(t), Some(true));
        }
        for f in ["0", "f", "F", "false", "FALSE", "False"] {
            assert_eq!(parse_bool(f), Some(false));
        }
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(parse_bool("tRuE"), None);
    }

    #[test]
    fn empty_spec_selects_everything() {
        let accts = vec![account(1, "a", None), account(2, "b", Some(Ctl::new()))];
        assert!(AccountSpec::parse(" , ", "me").unwrap().is_all());
        assert_eq!(select("", &accts).unwrap(), ids(&accts));
    }

    #[test]
    fn owner_me_and_tag() {
        let accts = vec![
            account(1, "a", Some(ctl("alice", &["tag1"]))),
            account(2, "b", Some(ctl("alice", &[]))),
            account(3, "c", Some(ctl("bob", &["tag1"]))),
            account(4, "d", Some(ctl("", &["tag1"]))),
        ];
        assert_eq!(select("owner=me,tag1", &accts).unwrap(), ["000000000001"]);
    }

    #[test]
    fn owner_predicates() {
        let accts = vec![
            account(1, "a", Some(ctl("alice", &[]))),
            account(2, "b", Some(ctl("bob", &[]))),
            account(3, "c", Some(ctl("", &[]))),
        ];
        assert_eq!(select("owner", &accts).unwrap(), ["000000000001", "000000000002"]);
        assert_eq!(select("!owner", &accts).unwrap(), ["000000000003"]);
        assert_eq!(select("owner=false", &accts).unwrap(), ["000000000003"]);
        assert_eq!(
            select("owner=alice,owner=bob", &accts).unwrap(),
            ["000000000001", "000000000002"]
        );
        assert_eq!(
            select("owner!=me", &accts).unwrap(),
            ["000000000002", "000000000003"]
        );
        assert_eq!(select("!owner=bob", &accts).unwrap(), ["000000000001", "000000000003"]);
    }

    #[test]
    fn negated_tag_and_bool_values() {
        let accts = vec![
            account(1, "a", Some(ctl("", &["x"]))),
            account(2, "b", Some(ctl("", &["x", "y"]))),
            account(3, "c", Some(ctl("", &["y"]))),
        ];
        assert_eq!(select("x,!y", &accts).unwrap(), ["000000000001"]);
        assert_eq!(select("x,y=0", &accts).unwrap(), ["000000000001"]);
        assert_eq!(select("x,y!=true", &accts).unwrap(), ["000000000001"]);
        assert_eq!(select("!x=f", &accts).unwrap(), ["000000000001", "000000000002"]);
    }

    #[test]
    fn errors_and_unmanaged_accounts() {
        let broken = account(1, "a", Some(ctl("", &["x"])));
        broken.update(|s| s.err = Some(OrgError::no_access("denied")));
        let unmanaged = account(2, "b", None);
        let ok = account(3, "c", Some(ctl("", &["x"])));
        let accts = vec![broken, unmanaged, ok];

        assert_eq!(select("x", &accts).unwrap(), ["000000000003"]);
        assert_eq!(select("x,err", &accts).unwrap(), ["000000000001", "000000000003"]);
        assert_eq!(select("!x", &accts).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn static_ids() {
        let accts = vec![account(1, "a", None), account(2, "b", None), account(3, "c", None)];
        assert_eq!(
            select("000000000003,000000000001", &accts).unwrap(),
            ["000000000001", "000000000003"]
        );
        assert_eq!(
            select("000000000009", &accts),
            Err(SpecError::UnknownId("000000000009".into()))
        );
        assert_eq!(
            select("000000000001,!000000000002", &accts),
            Err(SpecError::IllegalNegation("000000000002".into()))
        );
    }

    #[test]
    fn static_names() {
        let accts = vec![
            account(1, "a", Some(ctl("alice", &[]))),
            account(2, "b", Some(ctl("bob", &[]))),
            account(3, "Prod Main", None),
        ];
        assert_eq!(select("b,a", &accts).unwrap(), ["000000000001", "000000000002"]);
        assert_eq!(select("Prod Main", &accts).unwrap(), ["000000000003"]);
        assert_eq!(select("a,b,owner=bob", &accts).unwrap(), ["000000000002"]);
        assert_eq!(select("a,!b", &accts), Err(SpecError::IllegalNegation("b".into())));
        // Negation is reported before unknown names
        assert_eq!(select("a,zz,!b", &accts), Err(SpecError::IllegalNegation("b".into())));
        assert_eq!(select("a,zz", &accts), Err(SpecError::UnknownName("zz".into())));

        let ac = vec![account(1, "a", None), account(3, "c", None)];
        assert_eq!(select("a,!b", &ac), Err(SpecError::IllegalNegation("b".into())));
    }

    #[test]
    fn mixed_and_malformed_entries() {
        assert_eq!(
            AccountSpec::parse("000000000001,dev", "me"),
            Err(SpecError::MixedEntries("dev".into()))
        );
        for bad in ["=1", "!", "dev=yes", "err=maybe", "err=1", "owner=", "a!b", "!!dev"] {
            assert!(
                matches!(AccountSpec::parse(bad, "me"), Err(SpecError::InvalidEntry { .. })),
                "{bad:?}"
            );
        }
        // Tag syntax is checked once the words turn out not to be names
        let accts = vec![account(1, "a", Some(Ctl::new()))];
        assert!(matches!(select("Dev", &accts), Err(SpecError::InvalidEntry { .. })));
    }

    #[test]
    fn tag_limit() {
        let accts = vec![account(1, "a", Some(Ctl::new()))];
        let tags: Vec<String> = (0..MAX_TAGS).map(|i| format!("t{i}")).collect();
        assert!(select(&tags.join(","), &accts).is_ok());
        let too_many = format!("{},extra", tags.join(","));
        assert_eq!(select(&too_many, &accts), Err(SpecError::TooManyTags(MAX_TAGS)));
    }

    #[test]
    fn tag_selection_is_exact() {
        // Every account over a 4-tag universe against every disjoint
        // positive/negative split of a 3-tag subset
        let universe = ["a", "b", "c", "d"];
        let accts: Vec<Arc<Account>> = (0u64..16)
            .map(|bits| {
                let tags: Vec<&str> = (0..4).filter(|i| bits & (1 << i) != 0).map(|i| universe[i]).collect();
                account(bits + 1, &format!("n{bits}"), Some(ctl("", &tags)))
            })
            .collect();

        for assign in 0..27u32 {
            let (mut pos, mut neg) = (Vec::new(), Vec::new());
            let mut x = assign;
            for t in &universe[..3] {
                match x % 3 {
                    1 => pos.push(*t),
                    2 => neg.push(*t),
                    _ => {}
                }
                x /= 3;
            }
            if pos.is_empty() && neg.is_empty() {
                continue;
            }
            let spec: Vec<String> = pos
                .iter()
                .map(|t| t.to_string())
                .chain(neg.iter().map(|t| format!("!{t}")))
                .collect();
            let got = select(&spec.join(","), &accts).unwrap();
            let want: Vec<String> = accts
                .iter()
                .filter(|a| {
                    let c = a.ctl().unwrap();
                    pos.iter().all(|t| c.has_tag(t)) && neg.iter().all(|t| !c.has_tag(t))
                })
                .map(|a| a.id().to_string())
                .collect();
            assert_eq!(got, want, "spec {spec:?}");
        }
    }
}
