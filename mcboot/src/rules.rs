//! Evaluation of library admission rules against the host platform, and selection
//! of the native classifier matching the host OS.

use std::env;

use crate::engine::serde::{Library, Rule, RuleAction, RuleOs};


/// Return the normalized OS name used by upstream rules and natives mappings.
/// Returning none if the OS is not known.
///
/// This is currently not dynamic, so this will return the OS name the binary
/// has been compiled for.
#[inline]
pub fn os_name() -> Option<&'static str> {
    Some(match env::consts::OS {
        "windows" => "windows",
        "linux" => "linux",
        "macos" => "osx",
        _ => return None
    })
}

/// Return the host architecture name used by upstream rules.
///
/// This is currently not dynamic, so this will return the OS architecture the
/// binary has been compiled for.
#[inline]
pub fn os_arch() -> &'static str {
    env::consts::ARCH
}

/// Resolve all rules of a library and return true if it should be admitted on the
/// host platform. A library with absent or empty rules is always admitted; when
/// rules are present the action of the last matching rule wins, and a library
/// whose rules never match is rejected.
pub fn is_admitted(library: &Library) -> bool {
    match library.rules.as_deref() {
        None | Some([]) => true,
        Some(rules) => check_rules(rules),
    }
}

/// Resolve a sequence of rules against the host, returning the admission verdict.
pub fn check_rules(rules: &[Rule]) -> bool {

    // Initially disallowed...
    let mut allowed = false;

    for rule in rules {
        match check_rule(rule) {
            Some(RuleAction::Allow) => allowed = true,
            Some(RuleAction::Disallow) => allowed = false,
            None => (),
        }
    }

    allowed

}

/// Resolve a single rule object and return its action if the rule matches the host.
fn check_rule(rule: &Rule) -> Option<RuleAction> {
    check_rule_os(&rule.os).then_some(rule.action)
}

/// Resolve an OS rule object and return true if the host is matching it. An empty
/// OS constraint matches unconditionally.
fn check_rule_os(rule_os: &RuleOs) -> bool {

    if let (Some(name), Some(host_name)) = (&rule_os.name, os_name()) {
        if name != host_name {
            return false;
        }
    }

    // Upstream arch constraints are substring matches, e.g. "x86" matches "x86_64".
    if let Some(arch) = &rule_os.arch {
        if !os_arch().contains(arch.as_str()) {
            return false;
        }
    }

    true

}

/// If the library declares platform natives, return the classifier string mapped
/// to the host OS, if any.
pub fn natives_classifier(library: &Library) -> Option<&str> {
    let natives = library.natives.as_ref()?;
    let host_name = os_name()?;
    natives.get(host_name).map(String::as_str)
}
