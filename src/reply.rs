//! The transcript consumer: turns a finished transcript into a reply.

use tara_core::{Transcript, VoiceEvent};
use tracing::info;

use crate::EventSender;

/// Receives the transcript of every completed session that heard something.
pub trait TranscriptSink: Send + Sync {
    fn on_transcript(&self, transcript: Transcript);
}

/// Produces the assistant's answer to a transcript.
pub trait Responder: Send + Sync {
    fn reply(&self, transcript: &Transcript) -> String;
}

/// Keywords and the reply they trigger, checked in order.
const RULES: &[(&[&str], &str)] = &[
    (
        &["cancel", "cancellation", "reschedule"],
        "You can cancel or reschedule a booking from My Bookings up to 24 hours before it starts.",
    ),
    (
        &["book", "booking", "appointment", "session", "schedule"],
        "Sure! Pick a service and a time slot and I will hold the booking for you.",
    ),
    (
        &["price", "cost", "pricing", "fee", "much"],
        "Prices are listed on each service card. Members get 10% off every booking.",
    ),
    (
        &["subscription", "membership", "plan", "monthly"],
        "Our monthly plan includes four sessions and priority booking.",
    ),
    (
        &["loyalty", "points", "rewards"],
        "You earn one loyalty point for every completed booking. Check your balance on your profile.",
    ),
    (
        &["referral", "refer", "friend", "invite"],
        "Share your referral code and you both get a free session after their first booking.",
    ),
    (
        &["hello", "hi", "hey"],
        "Hi! I am Tara. Ask me about bookings, prices or your loyalty points.",
    ),
    (
        &["help", "support", "problem"],
        "I can help with bookings, cancellations, prices, subscriptions and loyalty points.",
    ),
];

const FALLBACK_REPLY: &str =
    "Sorry, I did not catch that. Try asking about bookings, prices or your loyalty points.";

/// Answers by matching whole words against a fixed rule table.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordResponder;

impl Responder for KeywordResponder {
    fn reply(&self, transcript: &Transcript) -> String {
        let words: Vec<String> = transcript
            .as_str()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        RULES
            .iter()
            .find(|(keywords, _)| words.iter().any(|w| keywords.contains(&w.as_str())))
            .map(|(_, reply)| reply.to_string())
            .unwrap_or_else(|| FALLBACK_REPLY.to_string())
    }
}

/// Sends a reply for every transcript as a [`VoiceEvent::Reply`].
pub struct ReplySink<R = KeywordResponder> {
    responder: R,
    events: EventSender,
}

impl ReplySink {
    pub fn new(events: EventSender) -> Self {
        Self::with_responder(KeywordResponder, events)
    }
}

impl<R: Responder> ReplySink<R> {
    pub fn with_responder(responder: R, events: EventSender) -> Self {
        Self { responder, events }
    }
}

impl<R: Responder> TranscriptSink for ReplySink<R> {
    fn on_transcript(&self, transcript: Transcript) {
        let reply = self.responder.reply(&transcript);
        info!(transcript = %transcript, "Replying to transcript");
        self.events.send(VoiceEvent::Reply(reply)).ok();
    }
}
