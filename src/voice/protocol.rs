//! Line protocol spoken with the voice subprocess over its standard streams.
//!
//! Both directions are newline-delimited UTF-8 JSON objects carrying a `type`
//! tag. [`ChildEvent`] is what the process prints on stdout, [`ControlMessage`]
//! is what the relay writes to its stdin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// Neutral midpoint used for any evaluation sub-score the judge left out.
pub const DEFAULT_SUB_SCORE: f64 = 3.0;

const REALISTIC_FLAG: &str = "realistic";
const REALISTIC_ASSESSMENT: &str = "Your responses are generally realistic";
const UNREALISTIC_ASSESSMENT: &str = "Your response is unrealistic";

/// One stdout line of the voice process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildEvent {
    /// Base64 PCM16 produced by the voice model.
    Audio { data: String },
    Debug {
        #[serde(default)]
        text: Value,
    },
    Text { text: String },
    Empathy {
        #[serde(default)]
        content: Value,
    },
    /// `content` is itself a JSON document, serialised as a string.
    EmpathyData { content: String },
    DiagnosisComplete {
        #[serde(default)]
        text: String,
    },
    DiagnosisVerdict {
        #[serde(default)]
        verdict: Value,
    },
}

/// One stdin line for the voice process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    StartAudio,
    Audio { data: String },
    Text { data: String },
    EndAudio,
}

impl ControlMessage {
    /// Serialise as one newline-terminated frame.
    pub fn to_line(&self) -> RelayResult<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| RelayError::Decode(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::StartAudio => "start_audio",
            ControlMessage::Audio { .. } => "audio",
            ControlMessage::Text { .. } => "text",
            ControlMessage::EndAudio => "end_audio",
        }
    }
}

/// Empathy evaluation in the shape the tutoring frontend renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpathySummary {
    pub overall_score: f64,
    pub avg_perspective_taking: f64,
    pub avg_emotional_resonance: f64,
    pub avg_acknowledgment: f64,
    pub avg_language_communication: f64,
    pub avg_cognitive_empathy: f64,
    pub avg_affective_empathy: f64,
    pub realism_assessment: String,
    pub realism_explanation: String,
    pub coach_assessment: String,
    pub strengths: Vec<String>,
    pub areas_for_improvement: Vec<String>,
    pub recommendations: Vec<String>,
    pub recommended_approach: String,
}

impl EmpathySummary {
    /// Remap the judge's raw evaluation document.
    ///
    /// Only a document that is not JSON at all is rejected; missing or
    /// mistyped fields fall back to their defaults.
    pub fn from_evaluation(raw: &str) -> RelayResult<Self> {
        let doc: Value = serde_json::from_str(raw)
            .map_err(|e| RelayError::Decode(format!("empathy_data content is not JSON: {}", e)))?;

        let realism_assessment = match doc.get("realism_flag").and_then(Value::as_str) {
            Some(REALISTIC_FLAG) => REALISTIC_ASSESSMENT,
            _ => UNREALISTIC_ASSESSMENT,
        };

        Ok(Self {
            overall_score: score(&doc, "empathy_score"),
            avg_perspective_taking: score(&doc, "perspective_taking"),
            avg_emotional_resonance: score(&doc, "emotional_resonance"),
            avg_acknowledgment: score(&doc, "acknowledgment"),
            avg_language_communication: score(&doc, "language_communication"),
            avg_cognitive_empathy: score(&doc, "cognitive_empathy"),
            avg_affective_empathy: score(&doc, "affective_empathy"),
            realism_assessment: realism_assessment.to_string(),
            realism_explanation: text_at(&doc, "/judge_reasoning/realism_justification"),
            coach_assessment: text_at(&doc, "/judge_reasoning/overall_assessment"),
            strengths: list_at(&doc, "/feedback/strengths"),
            areas_for_improvement: list_at(&doc, "/feedback/areas_for_improvement"),
            recommendations: list_at(&doc, "/feedback/improvement_suggestions"),
            recommended_approach: text_at(&doc, "/feedback/alternative_phrasing"),
        })
    }
}

fn score(doc: &Value, key: &str) -> f64 {
    doc.get(key)
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_SUB_SCORE)
}

fn text_at(doc: &Value, pointer: &str) -> String {
    doc.pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn list_at(doc: &Value, pointer: &str) -> Vec<String> {
    doc.pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// JSON truthiness as the voice process means it: `null`, `false`, `0` and
/// `""` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_lines() {
        assert_eq!(
            ControlMessage::StartAudio.to_line().unwrap(),
            "{\"type\":\"start_audio\"}\n"
        );
        assert_eq!(
            ControlMessage::Text { data: "hi".into() }.to_line().unwrap(),
            "{\"type\":\"text\",\"data\":\"hi\"}\n"
        );
        assert_eq!(
            ControlMessage::EndAudio.to_line().unwrap(),
            "{\"type\":\"end_audio\"}\n"
        );
    }

    #[test]
    fn test_child_event_parsing() {
        let event: ChildEvent =
            serde_json::from_str(r#"{"type":"diagnosis_verdict","verdict":true}"#).unwrap();
        assert_eq!(event, ChildEvent::DiagnosisVerdict { verdict: json!(true) });

        let event: ChildEvent =
            serde_json::from_str(r#"{"type":"audio","data":"AAA=","extra":1}"#).unwrap();
        assert_eq!(event, ChildEvent::Audio { data: "AAA=".into() });

        assert!(serde_json::from_str::<ChildEvent>(r#"{"type":"telemetry"}"#).is_err());
    }

    #[test]
    fn test_empathy_defaults() {
        let summary = EmpathySummary::from_evaluation(
            r#"{"empathy_score":4,"feedback":{"strengths":["good eye contact"]}}"#,
        )
        .unwrap();

        assert_eq!(summary.overall_score, 4.0);
        assert_eq!(summary.avg_perspective_taking, 3.0);
        assert_eq!(summary.avg_affective_empathy, 3.0);
        assert_eq!(summary.strengths, vec!["good eye contact".to_string()]);
        assert!(summary.areas_for_improvement.is_empty());
        assert!(summary.recommendations.is_empty());
        assert_eq!(summary.realism_assessment, "Your response is unrealistic");
        assert_eq!(summary.coach_assessment, "");
    }

    #[test]
    fn test_empathy_full_mapping() {
        let raw = json!({
            "empathy_score": 5,
            "perspective_taking": 4.5,
            "realism_flag": "realistic",
            "judge_reasoning": {
                "realism_justification": "Plausible bedside manner",
                "overall_assessment": "Strong rapport"
            },
            "feedback": {
                "improvement_suggestions": ["Ask open questions"],
                "alternative_phrasing": "How has this been affecting you?"
            }
        })
        .to_string();

        let summary = EmpathySummary::from_evaluation(&raw).unwrap();
        assert_eq!(summary.avg_perspective_taking, 4.5);
        assert_eq!(summary.realism_assessment, "Your responses are generally realistic");
        assert_eq!(summary.realism_explanation, "Plausible bedside manner");
        assert_eq!(summary.coach_assessment, "Strong rapport");
        assert_eq!(summary.recommendations, vec!["Ask open questions".to_string()]);
        assert_eq!(summary.recommended_approach, "How has this been affecting you?");
    }

    #[test]
    fn test_empathy_rejects_non_json() {
        assert!(matches!(
            EmpathySummary::from_evaluation("{not json"),
            Err(RelayError::Decode(_))
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("correct")));
        assert!(is_truthy(&json!({"diagnosis": "x"})));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
    }
}
