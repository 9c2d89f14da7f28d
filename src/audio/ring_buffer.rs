//! Fixed-capacity SPSC float ring with all-or-nothing transfers.
//!
//! Thin layer over `rtrb`: the writer half lives on one thread and the
//! reader half on another, so no lock guards the indices.

use rtrb::{Consumer, Producer, RingBuffer};

pub fn float_ring(capacity: usize) -> (RingWriter, RingReader) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    (RingWriter { producer }, RingReader { consumer })
}

pub struct RingWriter {
    producer: Producer<f32>,
}

impl RingWriter {
    pub fn capacity(&self) -> usize {
        self.producer.buffer().capacity()
    }

    pub fn available_to_write(&self) -> usize {
        self.producer.slots()
    }

    /// Pushes all of `data` or nothing.
    pub fn push(&mut self, data: &[f32]) -> bool {
        if data.len() > self.producer.slots() {
            return false;
        }
        match self.producer.write_chunk_uninit(data.len()) {
            Ok(chunk) => {
                chunk.fill_from_iter(data.iter().copied());
                true
            }
            Err(_) => false,
        }
    }
}

pub struct RingReader {
    consumer: Consumer<f32>,
}

impl RingReader {
    pub fn capacity(&self) -> usize {
        self.consumer.buffer().capacity()
    }

    pub fn available_to_read(&self) -> usize {
        self.consumer.slots()
    }

    /// Fills all of `out` or leaves the ring untouched.
    pub fn pop(&mut self, out: &mut [f32]) -> bool {
        if out.len() > self.consumer.slots() {
            return false;
        }
        match self.consumer.read_chunk(out.len()) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..].copy_from_slice(second);
                chunk.commit_all();
                true
            }
            Err(_) => false,
        }
    }

    /// Discards everything currently readable.
    pub fn clear(&mut self) {
        let n = self.consumer.slots();
        if let Ok(chunk) = self.consumer.read_chunk(n) {
            chunk.commit_all();
        }
    }
}
