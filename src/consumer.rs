// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Runs the registered handler for one delivery inside a consumer span and
//! isolates the dispatcher from handler failures, including panics.

use crate::{
    channel::Delivery,
    dispatcher::ConsumerDefinition,
    errors::AmqpError,
    handler::{Acker, ConsumerHandler, ConsumerMessage},
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Hands one delivery to the handler.
///
/// Returns `HandlerError` when the handler failed or panicked. Nothing is
/// acknowledged here: in manual mode that is the handler's job, so a failed
/// delivery stays unacknowledged and is redelivered when the channel closes.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    def: &ConsumerDefinition,
    handler: &Arc<dyn ConsumerHandler>,
    acker: Acker,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &def.queue);

    debug!(
        "received: {} - exchange: {} - redelivered: {}",
        delivery.delivery_tag, delivery.exchange, delivery.redelivered
    );

    let msg = ConsumerMessage::new(&def.queue, &def.consumer_tag, delivery, acker);

    let failure = match AssertUnwindSafe(handler.exec(&ctx, &msg))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            return Ok(());
        }
        Ok(Err(err)) => err.to_string(),
        Err(panic) => panic_message(panic.as_ref()),
    };

    let err = AmqpError::HandlerError(failure.clone());
    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(failure),
    });

    if def.auto_ack {
        warn!(
            delivery_tag = msg.delivery_tag(),
            "handler failed on an auto-acknowledged message, it is lost"
        );
    } else {
        error!(
            delivery_tag = msg.delivery_tag(),
            "handler failed, message left unacknowledged"
        );
    }

    Err(err)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_owned()
    }
}
