use crate::core::marshal::Value;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{
    AuthenticationReq, AuthenticationRsp, CallRequest, CallResponse, ErrorResponse, Message,
    MessageHeader, MessageKind, NotificationStream, SessionChangeNotification,
};
use crate::protocol::records::Record;
use tracing::{debug, warn};

/// Per-kind hooks for authenticated traffic.
///
/// Each hook receives the envelope header and takes ownership of the decoded
/// body. Returning `Some(value)` sends `value` back to the client. The default
/// implementations only log.
pub trait PacketHandler {
    fn handle_authentication_req(&mut self, header: &MessageHeader, _body: AuthenticationReq) -> Option<Value> {
        unhandled("authentication request", header)
    }

    fn handle_authentication_rsp(&mut self, header: &MessageHeader, _body: AuthenticationRsp) -> Option<Value> {
        unhandled("authentication response", header)
    }

    fn handle_call_req(&mut self, header: &MessageHeader, _call: CallRequest) -> Option<Value> {
        unhandled("call request", header)
    }

    fn handle_call_rsp(&mut self, header: &MessageHeader, _response: CallResponse) -> Option<Value> {
        unhandled("call response", header)
    }

    fn handle_notify(&mut self, header: &MessageHeader, _notify: NotificationStream) -> Option<Value> {
        unhandled("notification", header)
    }

    fn handle_error_response(&mut self, header: &MessageHeader, _body: ErrorResponse) -> Option<Value> {
        unhandled("error response", header)
    }

    fn handle_session_change(
        &mut self,
        header: &MessageHeader,
        _change: SessionChangeNotification,
    ) -> Option<Value> {
        unhandled("session change", header)
    }

    /// Messages of any other kind, undecoded.
    fn handle_other(&mut self, message: Message) -> Option<Value> {
        unhandled("packet", &message.header)
    }
}

fn unhandled(what: &str, header: &MessageHeader) -> Option<Value> {
    warn!(
        type_tag = header.type_tag,
        source = %header.source,
        "Unhandled {what}"
    );
    None
}

/// Handler that accepts every default hook.
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl PacketHandler for LoggingHandler {}

/// Routes decoded messages to a [`PacketHandler`].
///
/// Every error is scoped to the single message that caused it.
pub struct Dispatcher {
    handler: Box<dyn PacketHandler + Send>,
}

impl Dispatcher {
    pub fn new(handler: Box<dyn PacketHandler + Send>) -> Self {
        Self { handler }
    }

    pub fn dispatch(&mut self, message: Message) -> Result<Option<Value>> {
        let Some(kind) = message.header.kind() else {
            return Ok(self.handler.handle_other(message));
        };

        let reply = match kind {
            MessageKind::AuthenticationReq => {
                let (header, payload) = open(kind, message)?;
                let body = AuthenticationReq::decode(payload)?;
                self.handler.handle_authentication_req(&header, body)
            }
            MessageKind::AuthenticationRsp => {
                let (header, payload) = open(kind, message)?;
                let body = AuthenticationRsp::decode(payload)?;
                self.handler.handle_authentication_rsp(&header, body)
            }
            MessageKind::CallReq => {
                let (header, payload) = open(kind, message)?;
                let call = CallRequest::decode(payload)?;
                self.handler.handle_call_req(&header, call)
            }
            MessageKind::CallRsp => {
                let (header, payload) = open(kind, message)?;
                let response = CallResponse::decode(payload)?;
                self.handler.handle_call_rsp(&header, response)
            }
            MessageKind::Notification => {
                let (header, payload) = open(kind, message)?;
                if !header.destination.is_broadcast() {
                    return Err(ProtocolError::BadDestination);
                }
                let notify = NotificationStream::decode_for(&header.destination, payload)?;
                self.handler.handle_notify(&header, notify)
            }
            MessageKind::ErrorResponse => {
                let (header, payload) = open(kind, message)?;
                let body = ErrorResponse::decode(payload)?;
                self.handler.handle_error_response(&header, body)
            }
            MessageKind::SessionChangeNotification => {
                let (header, payload) = open(kind, message)?;
                let change = SessionChangeNotification::decode(payload)?;
                self.handler.handle_session_change(&header, change)
            }
            MessageKind::IdentificationReq
            | MessageKind::IdentificationRsp
            | MessageKind::TransportClosed
            | MessageKind::ResolveReq
            | MessageKind::ResolveRsp
            | MessageKind::SessionInitialState
            | MessageKind::PingReq
            | MessageKind::PingRsp => self.handler.handle_other(message),
        };
        Ok(reply)
    }
}

/// Check the type string against the tag and split off the body.
fn open(kind: MessageKind, message: Message) -> Result<(MessageHeader, Value)> {
    if message.header.type_string != kind.type_string() {
        return Err(ProtocolError::TypeStringMismatch {
            expected: kind.type_string(),
            found: message.header.type_string,
        });
    }

    let Message {
        header, payload, ..
    } = message;
    debug!(type_string = %header.type_string, source = %header.source, "Dispatching");
    Ok((header, payload))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::core::marshal::Dict;
    use crate::protocol::message::Address;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl PacketHandler for Recorder {
        fn handle_call_req(&mut self, _header: &MessageHeader, call: CallRequest) -> Option<Value> {
            self.calls.lock().unwrap().push(call.method);
            Some(Value::Tuple(vec![Value::Integer(1)]))
        }

        fn handle_notify(&mut self, _header: &MessageHeader, notify: NotificationStream) -> Option<Value> {
            self.calls.lock().unwrap().push(notify.notify_type);
            None
        }

        fn handle_other(&mut self, message: Message) -> Option<Value> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("other:{}", message.header.type_tag));
            None
        }
    }

    fn call(type_string: &str) -> Message {
        let mut header = MessageHeader::new(MessageKind::CallReq, Address::client(1, Some(1)), Address::any("svc"));
        header.type_string = type_string.to_owned();
        let body = CallRequest {
            remote_object: "svc".into(),
            method: "Ping".into(),
            args: vec![],
            kwargs: Dict::new(),
        };
        Message::new(header, body.encode())
    }

    fn dispatcher() -> (Dispatcher, Arc<Mutex<Vec<String>>>) {
        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        (Dispatcher::new(Box::new(recorder)), calls)
    }

    #[test]
    fn test_call_routes_to_hook() {
        let (mut d, calls) = dispatcher();
        let reply = d.dispatch(call("macho.CallReq")).unwrap();
        assert!(reply.is_some());
        assert_eq!(*calls.lock().unwrap(), vec!["Ping".to_string()]);
    }

    #[test]
    fn test_type_string_mismatch_skips_hook() {
        let (mut d, calls) = dispatcher();
        match d.dispatch(call("macho.CallRsp")) {
            Err(ProtocolError::TypeStringMismatch { expected, found }) => {
                assert_eq!(expected, "macho.CallReq");
                assert_eq!(found, "macho.CallRsp");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_bad_body_is_decode_error() {
        let (mut d, calls) = dispatcher();
        let mut message = call("macho.CallReq");
        message.payload = Value::Integer(3);
        assert!(matches!(d.dispatch(message), Err(ProtocolError::Decode(_))));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_notification_requires_broadcast() {
        let (mut d, calls) = dispatcher();
        let header = MessageHeader::new(MessageKind::Notification, Address::any("svc"), Address::any("svc"));
        let message = Message::new(header, Value::Tuple(vec![]));
        assert!(matches!(d.dispatch(message), Err(ProtocolError::BadDestination)));

        let header = MessageHeader::new(
            MessageKind::Notification,
            Address::any("svc"),
            Address::broadcast("OnChannelsJoined", "charid"),
        );
        d.dispatch(Message::new(header, Value::Tuple(vec![]))).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["OnChannelsJoined".to_string()]);
    }

    #[test]
    fn test_unknown_kind_goes_to_other() {
        let (mut d, calls) = dispatcher();
        let header = MessageHeader::new(MessageKind::PingReq, Address::any("svc"), Address::any("svc"));
        d.dispatch(Message::new(header, Value::None)).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["other:20".to_string()]);
    }

    #[test]
    fn test_every_routed_kind_checks_type_string() {
        let routed = [
            MessageKind::AuthenticationReq,
            MessageKind::AuthenticationRsp,
            MessageKind::CallReq,
            MessageKind::CallRsp,
            MessageKind::Notification,
            MessageKind::ErrorResponse,
            MessageKind::SessionChangeNotification,
        ];
        for kind in routed {
            let (mut d, calls) = dispatcher();
            let mut header = MessageHeader::new(kind, Address::any("svc"), Address::any("svc"));
            header.type_string = "macho.Bogus".to_owned();
            assert!(
                matches!(
                    d.dispatch(Message::new(header, Value::None)),
                    Err(ProtocolError::TypeStringMismatch { .. })
                ),
                "{kind:?} was not routed to a hook"
            );
            assert!(calls.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn test_passthrough_kinds_ignore_type_string() {
        let (mut d, calls) = dispatcher();
        for kind in [MessageKind::ResolveReq, MessageKind::SessionInitialState, MessageKind::PingRsp] {
            let mut header = MessageHeader::new(kind, Address::any("svc"), Address::any("svc"));
            header.type_string = "macho.Bogus".to_owned();
            assert_eq!(d.dispatch(Message::new(header, Value::None)).unwrap(), None);
        }
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["other:10".to_string(), "other:18".to_string(), "other:21".to_string()]
        );
    }

    #[test]
    fn test_default_hooks_reply_nothing() {
        let mut d = Dispatcher::new(Box::new(LoggingHandler));
        assert_eq!(d.dispatch(call("macho.CallReq")).unwrap(), None);
    }
}
