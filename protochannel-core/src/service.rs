//! Service registry: message decoders and the methods bound to them.
//!
//! A [`Service`] is built once per host (or client callback surface) and
//! shared by every connection. Each connection owns its own handler state
//! `S`; methods receive it mutably together with an [`OperationContext`].
//!
//! ```ignore
//! let service = Service::builder()
//!     .method(|calc: &mut Calculator, _ctx, req: AddRequest| {
//!         Ok(AddResponse { sum: calc.add(req.a, req.b) })
//!     })
//!     .one_way(|calc: &mut Calculator, _ctx, _req: Reset| {
//!         calc.reset();
//!         Ok(())
//!     })
//!     .build()?;
//! ```

use crate::context::OperationContext;
use crate::error::{HandlerError, ServiceError};
use protochannel_protocol::{read_message, ProtocolError, RingBuffer, MAX_MESSAGE_TYPE_ID};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A protobuf message with a registered wire type id.
pub trait ServiceMessage: prost::Message + Default + Send + 'static {
    /// Type id carried in message headers. Must fit in 22 bits.
    const MESSAGE_ID: u32;
}

/// A decoded message of some registered type.
pub type AnyMessage = Box<dyn Any + Send>;

type DecodeFn = fn(&mut RingBuffer, usize) -> Result<AnyMessage, ProtocolError>;

fn decode_as<M: ServiceMessage>(
    ring: &mut RingBuffer,
    len: usize,
) -> Result<AnyMessage, ProtocolError> {
    Ok(Box::new(read_message::<M>(ring, len)?))
}

/// Decoder registration for one message type.
#[derive(Clone)]
pub struct MessageRegistration {
    id: u32,
    name: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
}

impl MessageRegistration {
    fn of<M: ServiceMessage>() -> Self {
        Self {
            id: M::MESSAGE_ID,
            name: std::any::type_name::<M>(),
            type_id: TypeId::of::<M>(),
            decode: decode_as::<M>,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Decodes the next `len` bytes of the ring as this message type.
    pub fn decode(&self, ring: &mut RingBuffer, len: usize) -> Result<AnyMessage, ProtocolError> {
        (self.decode)(ring, len)
    }
}

/// An encoded response produced by a request/response method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message_type: u32,
    pub body: Vec<u8>,
}

type Invoke<S> =
    dyn Fn(&mut S, &mut OperationContext, AnyMessage) -> Result<Option<Reply>, HandlerError>
        + Send
        + Sync;

/// A handler bound to a request message type.
pub struct Method<S> {
    request_type: u32,
    response_type: Option<u32>,
    name: &'static str,
    invoke: Arc<Invoke<S>>,
}

impl<S> Clone for Method<S> {
    fn clone(&self) -> Self {
        Self {
            request_type: self.request_type,
            response_type: self.response_type,
            name: self.name,
            invoke: self.invoke.clone(),
        }
    }
}

impl<S> Method<S> {
    pub fn request_type(&self) -> u32 {
        self.request_type
    }

    /// Response type id; `None` for one-way methods.
    pub fn response_type(&self) -> Option<u32> {
        self.response_type
    }

    pub fn is_one_way(&self) -> bool {
        self.response_type.is_none()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs the handler. Returns the encoded response for request/response
    /// methods and `None` for one-way methods.
    pub fn invoke(
        &self,
        handler: &mut S,
        ctx: &mut OperationContext,
        message: AnyMessage,
    ) -> Result<Option<Reply>, HandlerError> {
        (self.invoke)(handler, ctx, message)
    }
}

impl<S> std::fmt::Debug for Method<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("request_type", &self.request_type)
            .field("response_type", &self.response_type)
            .finish()
    }
}

/// Registry of messages and methods for handler state `S`.
pub struct Service<S> {
    messages: HashMap<u32, MessageRegistration>,
    methods: HashMap<u32, Method<S>>,
}

impl<S: Send + 'static> Service<S> {
    pub fn builder() -> ServiceBuilder<S> {
        ServiceBuilder::new()
    }
}

impl<S> Service<S> {
    /// A service with no messages; every incoming request is rejected.
    pub fn empty() -> Self {
        Self {
            messages: HashMap::new(),
            methods: HashMap::new(),
        }
    }

    pub fn message(&self, id: u32) -> Option<&MessageRegistration> {
        self.messages.get(&id)
    }

    pub fn method(&self, request_type: u32) -> Option<&Method<S>> {
        self.methods.get(&request_type)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

impl<S> std::fmt::Debug for Service<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("messages", &self.messages.len())
            .field("methods", &self.methods.values().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a [`Service`]. Registration errors are collected and reported by
/// [`build`](ServiceBuilder::build).
pub struct ServiceBuilder<S> {
    messages: HashMap<u32, MessageRegistration>,
    methods: HashMap<u32, Method<S>>,
    errors: Vec<ServiceError>,
}

impl<S: Send + 'static> ServiceBuilder<S> {
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
            methods: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Registers a message type without binding a method to it.
    pub fn message<M: ServiceMessage>(mut self) -> Self {
        self.register::<M>();
        self
    }

    /// Binds a request/response method.
    pub fn method<Req, Resp, F>(mut self, handler: F) -> Self
    where
        Req: ServiceMessage,
        Resp: ServiceMessage,
        F: Fn(&mut S, &mut OperationContext, Req) -> Result<Resp, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register::<Req>();
        self.register::<Resp>();

        let invoke = move |state: &mut S,
                           ctx: &mut OperationContext,
                           message: AnyMessage|
              -> Result<Option<Reply>, HandlerError> {
            let request = downcast::<Req>(message)?;
            let response = handler(state, ctx, request)?;
            Ok(Some(Reply {
                message_type: Resp::MESSAGE_ID,
                body: prost::Message::encode_to_vec(&response),
            }))
        };
        self.bind::<Req>(Some(Resp::MESSAGE_ID), Arc::new(invoke));
        self
    }

    /// Binds a one-way method.
    pub fn one_way<Req, F>(mut self, handler: F) -> Self
    where
        Req: ServiceMessage,
        F: Fn(&mut S, &mut OperationContext, Req) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register::<Req>();

        let invoke = move |state: &mut S,
                           ctx: &mut OperationContext,
                           message: AnyMessage|
              -> Result<Option<Reply>, HandlerError> {
            let request = downcast::<Req>(message)?;
            handler(state, ctx, request)?;
            Ok(None)
        };
        self.bind::<Req>(None, Arc::new(invoke));
        self
    }

    pub fn build(mut self) -> Result<Service<S>, ServiceError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        Ok(Service {
            messages: self.messages,
            methods: self.methods,
        })
    }

    fn register<M: ServiceMessage>(&mut self) {
        let registration = MessageRegistration::of::<M>();
        if registration.id > MAX_MESSAGE_TYPE_ID {
            self.errors
                .push(ServiceError::MessageIdOutOfRange(registration.id));
            return;
        }
        match self.messages.get(&registration.id) {
            Some(existing) if existing.type_id != registration.type_id => {
                self.errors.push(ServiceError::DuplicateMessageId {
                    id: registration.id,
                    existing: existing.name,
                    new: registration.name,
                });
            }
            Some(_) => {}
            None => {
                self.messages.insert(registration.id, registration);
            }
        }
    }

    fn bind<Req: ServiceMessage>(&mut self, response_type: Option<u32>, invoke: Arc<Invoke<S>>) {
        if self.methods.contains_key(&Req::MESSAGE_ID) {
            self.errors.push(ServiceError::DuplicateMethod(Req::MESSAGE_ID));
            return;
        }
        self.methods.insert(
            Req::MESSAGE_ID,
            Method {
                request_type: Req::MESSAGE_ID,
                response_type,
                name: std::any::type_name::<Req>(),
                invoke,
            },
        );
    }
}

impl<S: Send + 'static> Default for ServiceBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<M: ServiceMessage>(message: AnyMessage) -> Result<M, HandlerError> {
    message.downcast::<M>().map(|m| *m).map_err(|_| {
        HandlerError::failed(format!(
            "dispatched message is not a {}",
            std::any::type_name::<M>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::StreamTable;
    use crate::transport::SendQueue;
    use protochannel_protocol::write_message;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(uint32, tag = "1")]
        value: u32,
    }

    impl ServiceMessage for Ping {
        const MESSAGE_ID: u32 = 1;
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Pong {
        #[prost(uint32, tag = "1")]
        value: u32,
    }

    impl ServiceMessage for Pong {
        const MESSAGE_ID: u32 = 2;
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Note {
        #[prost(string, tag = "1")]
        text: String,
    }

    impl ServiceMessage for Note {
        const MESSAGE_ID: u32 = 3;
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Impostor {
        #[prost(string, tag = "1")]
        text: String,
    }

    impl ServiceMessage for Impostor {
        const MESSAGE_ID: u32 = 3;
    }

    #[derive(Default)]
    struct Counter {
        notes: Vec<String>,
    }

    fn context() -> OperationContext {
        OperationContext::new(
            7,
            Ping::MESSAGE_ID,
            1,
            Arc::new(SendQueue::new()),
            Arc::new(StreamTable::new()),
        )
    }

    fn service() -> Service<Counter> {
        Service::builder()
            .method(|_: &mut Counter, _: &mut OperationContext, ping: Ping| {
                Ok(Pong { value: ping.value + 1 })
            })
            .one_way(|counter: &mut Counter, _: &mut OperationContext, note: Note| {
                counter.notes.push(note.text);
                Ok(())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_registration() {
        let service = service();
        assert_eq!(service.message_count(), 3);
        assert_eq!(service.method_count(), 2);

        let method = service.method(Ping::MESSAGE_ID).unwrap();
        assert!(!method.is_one_way());
        assert_eq!(method.response_type(), Some(Pong::MESSAGE_ID));

        let method = service.method(Note::MESSAGE_ID).unwrap();
        assert!(method.is_one_way());

        // Pong is decodable but has no method
        assert!(service.message(Pong::MESSAGE_ID).is_some());
        assert!(service.method(Pong::MESSAGE_ID).is_none());
    }

    #[test]
    fn test_decode_and_invoke() {
        let service = service();
        let mut ring = RingBuffer::new();
        write_message(&mut ring, &Ping { value: 41 });
        let len = ring.length() as usize;
        ring.set_position(0);

        let message = service
            .message(Ping::MESSAGE_ID)
            .unwrap()
            .decode(&mut ring, len)
            .unwrap();
        let mut counter = Counter::default();
        let reply = service
            .method(Ping::MESSAGE_ID)
            .unwrap()
            .invoke(&mut counter, &mut context(), message)
            .unwrap()
            .unwrap();

        assert_eq!(reply.message_type, Pong::MESSAGE_ID);
        let pong: Pong = prost::Message::decode(&reply.body[..]).unwrap();
        assert_eq!(pong.value, 42);
    }

    #[test]
    fn test_one_way_mutates_state() {
        let service = service();
        let mut counter = Counter::default();
        let reply = service
            .method(Note::MESSAGE_ID)
            .unwrap()
            .invoke(
                &mut counter,
                &mut context(),
                Box::new(Note {
                    text: "hello".into(),
                }),
            )
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(counter.notes, vec!["hello".to_string()]);
    }

    #[test]
    fn test_wrong_message_type_fails() {
        let service = service();
        let result = service.method(Ping::MESSAGE_ID).unwrap().invoke(
            &mut Counter::default(),
            &mut context(),
            Box::new(Note::default()),
        );
        assert!(matches!(result, Err(HandlerError::Failed(_))));
    }

    #[test]
    fn test_duplicate_message_id() {
        let result = Service::<Counter>::builder()
            .message::<Note>()
            .message::<Impostor>()
            .build();
        assert!(matches!(
            result,
            Err(ServiceError::DuplicateMessageId { id: 3, .. })
        ));
    }

    #[test]
    fn test_duplicate_method() {
        let result = Service::<Counter>::builder()
            .one_way(|_: &mut Counter, _: &mut OperationContext, _: Note| Ok(()))
            .one_way(|_: &mut Counter, _: &mut OperationContext, _: Note| Ok(()))
            .build();
        assert_eq!(result.unwrap_err(), ServiceError::DuplicateMethod(3));
    }

    #[test]
    fn test_empty_service() {
        let service = Service::<()>::empty();
        assert!(service.message(1).is_none());
        assert!(service.method(1).is_none());
    }
}
