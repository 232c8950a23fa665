//! Meeting capture domain: lifecycle status and persisted records.

pub mod model;
pub mod status;

pub use model::{
    meeting_code, user_hash_key, validate_meeting_url, AnalysisKind, AnalysisResult, Artifact,
    Artifacts, Meeting, NewMeeting, NewUser, User,
};
pub use status::{Failure, FailureStage, MeetingStatus};
