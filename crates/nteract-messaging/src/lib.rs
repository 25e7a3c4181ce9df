//! Kernel messaging protocol contracts: the message envelope, request
//! builders, reply filters, and the two wire encodings (signed ZMQ multipart
//! frames and Jupyter server websocket JSON).

pub mod message;
pub mod wire;

pub use message::{
    child_of, comm_msg, comm_open, create_message, execute_request, execution_state,
    input_reply, interrupt_request, kernel_info_request, language_info, of_message_type,
    shutdown_request, Channel, ExecuteOptions, ExecutionState, Header, JupyterMessage,
    LanguageInfo, PROTOCOL_VERSION,
};
pub use wire::{
    decode_ws_frame, decode_zmq_frames, encode_ws_frame, encode_zmq_frames, MessageSigner,
    WireError, DEFAULT_SIGNATURE_SCHEME, DELIMITER,
};
