use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    offers_received: AtomicU64,
    answers_received: AtomicU64,
    candidates_received: AtomicU64,
    teardowns_received: AtomicU64,
    incoming_polls: AtomicU64,
    session_polls: AtomicU64,
    typing_signals: AtomicU64,
    typing_polls: AtomicU64,
    profile_lookups_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_offer(&self) {
        self.offers_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_answer(&self) {
        self.answers_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_candidate(&self) {
        self.candidates_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_teardown(&self) {
        self.teardowns_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_incoming_poll(&self) {
        self.incoming_polls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_session_poll(&self) {
        self.session_polls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_typing_signal(&self) {
        self.typing_signals.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_typing_poll(&self) {
        self.typing_polls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_profile_lookup_dropped(&self) {
        self.profile_lookups_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE callwire_offers_received counter\ncallwire_offers_received {}\n# TYPE callwire_answers_received counter\ncallwire_answers_received {}\n# TYPE callwire_candidates_received counter\ncallwire_candidates_received {}\n# TYPE callwire_teardowns_received counter\ncallwire_teardowns_received {}\n# TYPE callwire_incoming_polls counter\ncallwire_incoming_polls {}\n# TYPE callwire_session_polls counter\ncallwire_session_polls {}\n# TYPE callwire_typing_signals counter\ncallwire_typing_signals {}\n# TYPE callwire_typing_polls counter\ncallwire_typing_polls {}\n# TYPE callwire_profile_lookups_dropped counter\ncallwire_profile_lookups_dropped {}\n",
            self.offers_received.load(Ordering::SeqCst),
            self.answers_received.load(Ordering::SeqCst),
            self.candidates_received.load(Ordering::SeqCst),
            self.teardowns_received.load(Ordering::SeqCst),
            self.incoming_polls.load(Ordering::SeqCst),
            self.session_polls.load(Ordering::SeqCst),
            self.typing_signals.load(Ordering::SeqCst),
            self.typing_polls.load(Ordering::SeqCst),
            self.profile_lookups_dropped.load(Ordering::SeqCst)
        )
    }
}
