use crate::nlu::NluResult;
use crate::store::QuestionnaireKind;

/// Side effect requested by the NLU agent through `result.action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    WhoAreYou,
    PamSum { score: i64 },
    QuestionnaireStart { kind: QuestionnaireKind },
    Sf12Answer { answer: String },
    QuestionnaireStop,
    ConnectNokia,
    ConnectVitadock,
    ConnectWunderlist,
    RecipeSearch { term: String },
    RecipeSelect { choice: usize },
    Escalate,
    /// An action name this agent version does not know.
    Unknown(String),
    /// Plain small talk: reply with the agent's speech.
    None,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("action {action} is missing parameter {param}")]
    MissingParameter {
        action: &'static str,
        param: &'static str,
    },
    #[error("action {action} has invalid {param}: {value}")]
    InvalidParameter {
        action: &'static str,
        param: &'static str,
        value: String,
    },
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Self::WhoAreYou => "who_are_you",
            Self::PamSum { .. } => "pam_sum",
            Self::QuestionnaireStart { .. } => "questionnaire_start",
            Self::Sf12Answer { .. } => "sf12_answer",
            Self::QuestionnaireStop => "questionnaire_stop",
            Self::ConnectNokia => "connect_nokia",
            Self::ConnectVitadock => "connect_vitadock",
            Self::ConnectWunderlist => "connect_wunderlist",
            Self::RecipeSearch { .. } => "recipe_search",
            Self::RecipeSelect { .. } => "recipe_select",
            Self::Escalate => "escalate",
            Self::Unknown(name) => name,
            Self::None => "",
        }
    }

    pub fn from_result(result: &NluResult) -> Result<Self, ActionError> {
        let action = match result.action.trim() {
            "" | "input.unknown" | "smalltalk" => Self::None,
            "who_are_you" => Self::WhoAreYou,
            "pam_sum" => {
                let raw = result.param_str("pam_score").ok_or(ActionError::MissingParameter {
                    action: "pam_sum",
                    param: "pam_score",
                })?;
                let score = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.fract() == 0.0 && (0.0..=4.0).contains(s))
                    .map(|s| s as i64)
                    .ok_or(ActionError::InvalidParameter {
                        action: "pam_sum",
                        param: "pam_score",
                        value: raw,
                    })?;
                Self::PamSum { score }
            }
            "questionnaire_start" => {
                let kind = match result.param_str("questionnaire") {
                    None => QuestionnaireKind::Pam,
                    Some(raw) => QuestionnaireKind::parse(&raw).ok_or(
                        ActionError::InvalidParameter {
                            action: "questionnaire_start",
                            param: "questionnaire",
                            value: raw,
                        },
                    )?,
                };
                Self::QuestionnaireStart { kind }
            }
            "sf12_answer" => {
                let answer = result
                    .param_str("answer")
                    .or_else(|| non_empty(&result.resolved_query))
                    .ok_or(ActionError::MissingParameter {
                        action: "sf12_answer",
                        param: "answer",
                    })?;
                Self::Sf12Answer { answer }
            }
            "questionnaire_stop" => Self::QuestionnaireStop,
            "connect_nokia" => Self::ConnectNokia,
            "connect_vitadock" => Self::ConnectVitadock,
            "connect_wunderlist" => Self::ConnectWunderlist,
            "recipe_search" => {
                let term = result
                    .param_str("ingredient")
                    .or_else(|| result.param_str("recipe"))
                    .or_else(|| non_empty(&result.resolved_query))
                    .ok_or(ActionError::MissingParameter {
                        action: "recipe_search",
                        param: "ingredient",
                    })?;
                Self::RecipeSearch { term }
            }
            "recipe_select" => {
                let choice = result
                    .param_i64("number")
                    .ok_or(ActionError::MissingParameter {
                        action: "recipe_select",
                        param: "number",
                    })?;
                let choice = usize::try_from(choice)
                    .ok()
                    .filter(|c| *c > 0)
                    .ok_or(ActionError::InvalidParameter {
                        action: "recipe_select",
                        param: "number",
                        value: choice.to_string(),
                    })?;
                Self::RecipeSelect { choice }
            }
            "escalate" => Self::Escalate,
            other => Self::Unknown(other.to_string()),
        };
        Ok(action)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
