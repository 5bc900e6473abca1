use tokio::sync::mpsc;

/// A multicast observer list for one event kind.
///
/// Subscribers receive every event emitted after they subscribe. Delivery is
/// through an unbounded channel, so emission never blocks or re-enters the
/// emitting component; per component, the observable ordering is the
/// emission order.
pub struct Multicast<E: Clone> {
	subscribers: Vec<mpsc::UnboundedSender<E>>,
}

impl<E: Clone> Default for Multicast<E> {
	fn default() -> Self {
		Self {
			subscribers: Vec::new(),
		}
	}
}

impl<E: Clone + std::fmt::Debug> Multicast<E> {
	pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.subscribers.push(tx);
		rx
	}

	pub fn emit(&mut self, event: E) {
		tracing::trace!(?event, "emit");
		self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
	}
}

/// Events observable on a media source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaSourceEvent {
	SourceOpen,
	SourceEnded,
	SourceClose,
}

/// Events observable on a source buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceBufferEvent {
	UpdateStart,
	Update,
	UpdateEnd,
	Error,
	Abort,
}

/// Notifications from an attached media source to its media element.
///
/// This channel stands in for the DOM's element back-pointer: the element
/// drains it on every tick, so signals are observed in order without either
/// side re-entering the other.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HostSignal {
	/// The first initialization segment produced at least one active track.
	HaveMetadata,

	/// Track buffers changed; element-level buffered must be recomputed.
	BufferedChanged,

	/// The media source duration changed to this value.
	DurationChanged(f64),

	/// `end_of_stream` succeeded; the buffered data is all the data.
	AllDataBuffered,

	/// Buffered data in `[start, end)` seconds was removed.
	Removed { start: f64, end: f64 },
}

/// The attachment handle a media element registers with a media source.
#[derive(Clone)]
pub struct Host {
	tx: mpsc::UnboundedSender<HostSignal>,
}

impl Host {
	/// Create a host handle and the receiving side the element drains.
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<HostSignal>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	pub(crate) fn signal(&self, signal: HostSignal) {
		tracing::trace!(?signal, "host signal");
		// The receiver may already be gone during detach; that's fine.
		let _ = self.tx.send(signal);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn multicast_delivers_in_order() {
		let mut events = Multicast::default();
		let mut rx = events.subscribe();

		events.emit(SourceBufferEvent::UpdateStart);
		events.emit(SourceBufferEvent::Update);
		events.emit(SourceBufferEvent::UpdateEnd);

		assert_eq!(rx.try_recv(), Ok(SourceBufferEvent::UpdateStart));
		assert_eq!(rx.try_recv(), Ok(SourceBufferEvent::Update));
		assert_eq!(rx.try_recv(), Ok(SourceBufferEvent::UpdateEnd));
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn multicast_prunes_closed_subscribers() {
		let mut events = Multicast::default();
		let rx = events.subscribe();
		let mut live = events.subscribe();
		drop(rx);

		events.emit(MediaSourceEvent::SourceOpen);
		assert_eq!(live.try_recv(), Ok(MediaSourceEvent::SourceOpen));
	}
}
