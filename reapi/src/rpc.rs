//! `google.rpc.Status`, as carried inside [crate::ExecuteResponse].
//!
//! This is the application-level status the execution service reports for
//! the action itself, distinct from the transport-level status of the RPC
//! that delivered it.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    /// A `google.rpc.Code` value.
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}
