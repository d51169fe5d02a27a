//! Fixed-capacity ring storage for audio pipelines.
//!
//! This crate provides [`Ring<T>`], the circular buffer every stage of the
//! trackmix pipeline is built on: user byte rings, per-stage scratch rings,
//! track output rings and the hardware ring.
//!
//! Unlike a streaming channel, a ring never blocks and has no error path.
//! It hands out the longest contiguous run before the end of storage, lets
//! the caller copy into or out of it, and then advances a cursor by exactly
//! the amount copied:
//!
//! ```
//! use trackmix_buffer::Ring;
//!
//! let mut ring = Ring::<u8>::new(4, 1);
//! ring.write(b"abc");
//! ring.take(2);
//! ring.write(b"de");
//!
//! // "cd" is readable before the wrap, "e" after it.
//! assert_eq!(ring.used_contig(), 2);
//! assert_eq!(ring.used(), 3);
//! ```
//!
//! # Thread Safety
//!
//! `Ring<T>` is a plain owned value. Sharing it between threads is up to the
//! owner, usually by keeping it behind the lock of the track or mixer it
//! belongs to.

mod ring;

pub use ring::Ring;
