//! Tolerant mapping of free-text pole, status and priority values.
//!
//! Every function here is total: input that matches no rule comes back
//! trimmed as an `Other` value instead of failing.

use unicode_normalization::UnicodeNormalization;

use crate::types::{Pole, Priority, Status};

/// Lower-cases, trims and strips combining diacritics so `"  Échéance"`
/// and `"echeance"` compare equal.
pub fn norm_key(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .nfd()
        .filter(|ch| !is_combining_diacritic(*ch))
        .collect()
}

fn is_combining_diacritic(ch: char) -> bool {
    ('\u{0300}'..='\u{036f}').contains(&ch)
}

pub fn normalize_pole(raw: &str) -> Pole {
    let key = norm_key(raw);
    if key.is_empty() {
        return Pole::Unassigned;
    }

    if key == "bcs" || key.contains("bien") || key.contains("chez") || key.contains("soi") {
        return Pole::Bcs;
    }
    if key == "evo" || key.contains("evolumis") {
        return Pole::Evo;
    }
    if key == "perso" || key == "personnel" || key == "personal" || key.contains("perso") {
        return Pole::Perso;
    }

    Pole::Other(raw.trim().to_string())
}

pub fn normalize_status(raw: &str) -> Status {
    let key = norm_key(raw);
    if key.is_empty() {
        return Status::Backlog;
    }

    if key == "backlog" || key == "todo" || key.contains("a faire") || key.contains("to do") {
        return Status::Backlog;
    }
    if key == "encours" || key.contains("en cours") || key.contains("in progress") {
        return Status::EnCours;
    }
    if key == "enattente"
        || key.contains("en attente")
        || key.contains("waiting")
        || key.contains("blocked")
    {
        return Status::EnAttente;
    }
    if key == "termine"
        || key.contains("termine")
        || key.contains("done")
        || key.contains("completed")
    {
        return Status::Termine;
    }

    Status::Other(raw.trim().to_string())
}

pub fn normalize_priority(raw: &str) -> Priority {
    let key = norm_key(raw);
    if key.is_empty() {
        return Priority::P2;
    }

    if key == "p1" || key == "1" || key.contains("urgent") || key.contains("crit") {
        return Priority::P1;
    }
    if key == "p2" || key == "2" || key.contains("high") {
        return Priority::P2;
    }
    if key == "p3" || key == "3" || key.contains("low") {
        return Priority::P3;
    }

    Priority::Other(raw.trim().to_string())
}
