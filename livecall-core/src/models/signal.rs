//! Call signalling payloads delivered to users through the push service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum SignalKind {
    BeingRequested = 1,
    CancelRequested = 2,
    RejectRequest = 3,
    AcceptRequest = 4,
    Hangup = 5,
    EndCall = 6,
    Kick = 7,
}

impl From<SignalKind> for i32 {
    fn from(kind: SignalKind) -> Self {
        kind as Self
    }
}

impl TryFrom<i32> for SignalKind {
    type Error = crate::Error;

    fn try_from(code: i32) -> crate::Result<Self> {
        Ok(match code {
            1 => Self::BeingRequested,
            2 => Self::CancelRequested,
            3 => Self::RejectRequest,
            4 => Self::AcceptRequest,
            5 => Self::Hangup,
            6 => Self::EndCall,
            7 => Self::Kick,
            other => return Err(crate::Error::InvalidInput(format!("unknown signal {other}"))),
        })
    }
}

/// Envelope pushed to clients: `body` is itself a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub body: String,
}

#[derive(Debug, Serialize)]
struct BeingRequested<'a> {
    room_id: &'a str,
    members: &'a [i64],
    request_id: i64,
    mode: i32,
    msg: &'a str,
    create_time: i64,
    timeout_time: i64,
}

#[derive(Debug, Serialize)]
struct CancelRequested<'a> {
    room_id: &'a str,
    msg: &'a str,
    create_time: i64,
    cancel_time: i64,
}

/// Shared shape of the per-user reaction signals.
#[derive(Debug, Serialize)]
struct MemberAction<'a> {
    room_id: &'a str,
    u_id: i64,
    msg: &'a str,
    #[serde(flatten)]
    at: ActionTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    kick_u_ids: Option<&'a [i64]>,
}

#[derive(Debug, Serialize)]
enum ActionTime {
    #[serde(rename = "reject_time")]
    Reject(i64),
    #[serde(rename = "accept_time")]
    Accept(i64),
    #[serde(rename = "hangup_time")]
    Hangup(i64),
    #[serde(rename = "end_call_time")]
    EndCall(i64),
    #[serde(rename = "kick_time")]
    Kick(i64),
}

impl Signal {
    fn encode(kind: SignalKind, body: &impl Serialize) -> crate::Result<Self> {
        Ok(Self {
            kind,
            body: serde_json::to_string(body)?,
        })
    }

    pub fn being_requested(
        room_id: &str,
        members: &[i64],
        mode: i32,
        msg: &str,
        request_id: i64,
        create_time: i64,
        timeout_time: i64,
    ) -> crate::Result<Self> {
        Self::encode(
            SignalKind::BeingRequested,
            &BeingRequested {
                room_id,
                members,
                request_id,
                mode,
                msg,
                create_time,
                timeout_time,
            },
        )
    }

    pub fn cancel_requested(room_id: &str, msg: &str, create_time: i64, cancel_time: i64) -> crate::Result<Self> {
        Self::encode(
            SignalKind::CancelRequested,
            &CancelRequested {
                room_id,
                msg,
                create_time,
                cancel_time,
            },
        )
    }

    pub fn reject_request(room_id: &str, msg: &str, u_id: i64, at: i64) -> crate::Result<Self> {
        Self::member_action(SignalKind::RejectRequest, room_id, msg, u_id, ActionTime::Reject(at), None)
    }

    pub fn accept_request(room_id: &str, msg: &str, u_id: i64, at: i64) -> crate::Result<Self> {
        Self::member_action(SignalKind::AcceptRequest, room_id, msg, u_id, ActionTime::Accept(at), None)
    }

    pub fn hangup(room_id: &str, msg: &str, u_id: i64, at: i64) -> crate::Result<Self> {
        Self::member_action(SignalKind::Hangup, room_id, msg, u_id, ActionTime::Hangup(at), None)
    }

    pub fn end_call(room_id: &str, msg: &str, u_id: i64, at: i64) -> crate::Result<Self> {
        Self::member_action(SignalKind::EndCall, room_id, msg, u_id, ActionTime::EndCall(at), None)
    }

    pub fn kick(room_id: &str, msg: &str, u_id: i64, at: i64, kicked: &[i64]) -> crate::Result<Self> {
        Self::member_action(SignalKind::Kick, room_id, msg, u_id, ActionTime::Kick(at), Some(kicked))
    }

    fn member_action(
        kind: SignalKind,
        room_id: &str,
        msg: &str,
        u_id: i64,
        at: ActionTime,
        kick_u_ids: Option<&[i64]>,
    ) -> crate::Result<Self> {
        Self::encode(
            kind,
            &MemberAction {
                room_id,
                u_id,
                msg,
                at,
                kick_u_ids,
            },
        )
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_accept_signal_body() {
        let signal = Signal::accept_request("r1", "", 9, 1234).unwrap();
        assert_eq!(signal.kind, SignalKind::AcceptRequest);
        let body: Value = serde_json::from_str(&signal.body).unwrap();
        assert_eq!(body["u_id"], 9);
        assert_eq!(body["accept_time"], 1234);
        assert!(body.get("kick_u_ids").is_none());
    }

    #[test]
    fn test_envelope_uses_numeric_type() {
        let signal = Signal::kick("r1", "bye", 1, 50, &[2, 3]).unwrap();
        let envelope: Value = serde_json::from_str(&signal.to_json().unwrap()).unwrap();
        assert_eq!(envelope["type"], 7);
        let body: Value = serde_json::from_str(envelope["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["kick_time"], 50);
        assert_eq!(body["kick_u_ids"], serde_json::json!([2, 3]));
    }

    #[test]
    fn test_being_requested_carries_timeout() {
        let signal = Signal::being_requested("r1", &[4, 5], 3, "hi", 1, 100, 60_100).unwrap();
        let body: Value = serde_json::from_str(&signal.body).unwrap();
        assert_eq!(body["request_id"], 1);
        assert_eq!(body["timeout_time"], 60_100);
        assert_eq!(body["members"], serde_json::json!([4, 5]));
    }
}
