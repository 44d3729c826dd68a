//! Answer option tables offered under questionnaire questions.

use crate::channels::QuickReply;

pub const SF12_QUESTIONS: i64 = 12;

const PAM_SCALE: &[(&str, &str)] = &[
    ("😁", "4"),
    ("🙂", "3"),
    ("😞", "2"),
    ("😡", "1"),
    ("N.v.t", "0"),
];

const BAD_GREAT: &[&str] = &["Uitstekend", "Zeer goed", "Goed", "Matig", "Slecht"];
const HINDERED: &[&str] = &[
    "Ja, ernstig beperkt",
    "Ja, een beetje beperkt",
    "Nee helemaal niet beperkt",
];
const YES_NO: &[&str] = &["Ja", "Nee"];
const NOT_LOT: &[&str] = &[
    "Heel erg veel",
    "Veel",
    "Nogal",
    "Een klein beetje",
    "Helemaal niet",
];
const NEVER_ALWAYS: &[&str] = &["Voortdurend", "Meestal", "Vaak", "Soms", "Zelden", "Nooit"];

/// The PAM emoji scale; "N.v.t" (not applicable) scores 0.
pub fn pam_scale() -> Vec<QuickReply> {
    PAM_SCALE
        .iter()
        .map(|(title, payload)| QuickReply::new(*title, *payload))
        .collect()
}

fn sf12_options(question: i64) -> Option<&'static [&'static str]> {
    match question {
        1 => Some(BAD_GREAT),
        2 | 3 => Some(HINDERED),
        4..=7 => Some(YES_NO),
        8 => Some(NOT_LOT),
        9..=12 => Some(NEVER_ALWAYS),
        _ => None,
    }
}

/// Options for SF-12 question `question` (1-based). Empty past the last question.
pub fn sf12(question: i64) -> Vec<QuickReply> {
    sf12_options(question)
        .unwrap_or_default()
        .iter()
        .map(|option| QuickReply::new(*option, *option))
        .collect()
}

/// 1-based position of `answer` among the options of `question`.
pub fn sf12_score(question: i64, answer: &str) -> Option<i64> {
    let answer = answer.trim();
    sf12_options(question)?
        .iter()
        .position(|option| option.eq_ignore_ascii_case(answer))
        .and_then(|idx| i64::try_from(idx + 1).ok())
}
