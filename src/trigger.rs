//! Pure decision of whether a decoded inbound event should start an AI
//! development attempt. Takes no I/O dependency so it is trivially unit
//! tested and reusable from any ingestion surface.

use serde::{Deserialize, Serialize};

use crate::domain::TaskDescriptor;

/// The pair of settings that decides which events begin work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub trigger_label: String,
    pub trigger_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueEvent {
    pub action: String,
    pub issue_number: i64,
    pub issue_title: String,
    pub issue_url: String,
    pub issue_body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue_number: i64,
    pub issue_title: String,
    pub issue_url: String,
    pub issue_body: String,
    pub comment_body: String,
}

/// A decoded inbound event, already parsed from its wire format by the
/// (out-of-scope) ingestion layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Issue(IssueEvent),
    IssueComment(IssueCommentEvent),
    Other,
}

/// Whether `event` should start a [`TaskDescriptor`]-driven pipeline run.
pub fn evaluate(event: &InboundEvent, policy: &TriggerPolicy) -> Option<TaskDescriptor> {
    match event {
        InboundEvent::Issue(issue) => {
            if issue_trigger(&issue.action, &issue.labels, &policy.trigger_label) {
                Some(TaskDescriptor {
                    issue_number: issue.issue_number,
                    issue_title: issue.issue_title.clone(),
                    issue_url: issue.issue_url.clone(),
                    issue_body: issue.issue_body.clone(),
                })
            } else {
                None
            }
        }
        InboundEvent::IssueComment(comment) => {
            if comment.action == "created"
                && comment_trigger(&comment.comment_body, &policy.trigger_command)
            {
                Some(TaskDescriptor {
                    issue_number: comment.issue_number,
                    issue_title: comment.issue_title.clone(),
                    issue_url: comment.issue_url.clone(),
                    issue_body: comment.issue_body.clone(),
                })
            } else {
                None
            }
        }
        InboundEvent::Other => None,
    }
}

/// Triggers iff the action is `"labeled"` and `labels` contains `trigger_label`.
fn issue_trigger(action: &str, labels: &[String], trigger_label: &str) -> bool {
    action == "labeled" && labels.iter().any(|l| l == trigger_label)
}

/// Triggers iff `comment_body` contains `trigger_command`, case-insensitively.
/// An empty comment never triggers.
fn comment_trigger(comment_body: &str, trigger_command: &str) -> bool {
    if comment_body.is_empty() {
        return false;
    }
    comment_body
        .to_lowercase()
        .contains(&trigger_command.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TriggerPolicy {
        TriggerPolicy {
            trigger_label: "ai-develop".to_string(),
            trigger_command: "/devpilot".to_string(),
        }
    }

    fn issue_event(action: &str, labels: Vec<&str>) -> IssueEvent {
        IssueEvent {
            action: action.to_string(),
            issue_number: 7,
            issue_title: "Title".to_string(),
            issue_url: "https://example.test/7".to_string(),
            issue_body: "Body".to_string(),
            labels: labels.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn issue_labeled_with_trigger_label_triggers() {
        let event = InboundEvent::Issue(issue_event("labeled", vec!["ai-develop", "bug"]));
        assert!(evaluate(&event, &policy()).is_some());
    }

    #[test]
    fn issue_labeled_with_other_label_does_not_trigger() {
        let event = InboundEvent::Issue(issue_event("labeled", vec!["bug"]));
        assert!(evaluate(&event, &policy()).is_none());
    }

    #[test]
    fn issue_unlabeled_never_triggers_even_with_trigger_label_present() {
        let event = InboundEvent::Issue(issue_event("unlabeled", vec!["ai-develop"]));
        assert!(evaluate(&event, &policy()).is_none());
    }

    #[test]
    fn comment_created_with_command_triggers_case_insensitively() {
        let event = InboundEvent::IssueComment(IssueCommentEvent {
            action: "created".to_string(),
            issue_number: 7,
            issue_title: "Title".to_string(),
            issue_url: "https://example.test/7".to_string(),
            issue_body: "Body".to_string(),
            comment_body: "please /DevPilot this".to_string(),
        });
        assert!(evaluate(&event, &policy()).is_some());
    }

    #[test]
    fn comment_without_command_does_not_trigger() {
        let event = InboundEvent::IssueComment(IssueCommentEvent {
            action: "created".to_string(),
            issue_number: 7,
            issue_title: "Title".to_string(),
            issue_url: "https://example.test/7".to_string(),
            issue_body: "Body".to_string(),
            comment_body: "just chatting".to_string(),
        });
        assert!(evaluate(&event, &policy()).is_none());
    }

    #[test]
    fn empty_comment_never_triggers() {
        assert!(!comment_trigger("", "/devpilot"));
    }

    #[test]
    fn comment_edited_not_created_does_not_trigger() {
        let event = InboundEvent::IssueComment(IssueCommentEvent {
            action: "edited".to_string(),
            issue_number: 7,
            issue_title: "Title".to_string(),
            issue_url: "https://example.test/7".to_string(),
            issue_body: "Body".to_string(),
            comment_body: "/devpilot".to_string(),
        });
        assert!(evaluate(&event, &policy()).is_none());
    }
}
