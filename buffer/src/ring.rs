//! Fixed-capacity frame ring.

/// A fixed-capacity circular buffer counted in frames.
///
/// `Ring<T>` owns `capacity * frame_len` elements of storage. A *frame* is
/// `frame_len` consecutive elements (one sample per channel for PCM rings, a
/// single byte for byte rings). All cursors and counts are in frames.
///
/// The ring never blocks and never allocates after construction. Callers copy
/// data into [`Ring::tail_mut`] and then commit it with [`Ring::push`], or
/// consume [`Ring::head`] and release it with [`Ring::take`]. Those two views
/// only expose the longest run that does not cross the end of storage, so a
/// wrapped region is handled by calling twice.
///
/// # Semantics
///
/// - `0 <= used <= capacity` always holds
/// - `head < capacity` whenever `capacity > 0`
/// - over-push and over-take are contract violations checked only in debug
///   builds
///
/// # Example
///
/// ```
/// use trackmix_buffer::Ring;
///
/// // Stereo ring holding four frames.
/// let mut ring = Ring::<i16>::new(4, 2);
/// ring.tail_mut()[..4].copy_from_slice(&[1, -1, 2, -2]);
/// ring.push(2);
///
/// assert_eq!(ring.used(), 2);
/// assert_eq!(ring.head(), &[1, -1, 2, -2]);
///
/// ring.take(2);
/// assert!(ring.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct Ring<T> {
    buf: Vec<T>,
    frame_len: usize,
    capacity: usize,
    head: usize,
    used: usize,
}

impl<T: Copy + Default> Ring<T> {
    /// Creates a ring holding `capacity` frames of `frame_len` elements.
    pub fn new(capacity: usize, frame_len: usize) -> Self {
        assert!(frame_len > 0, "frame_len must be greater than 0");
        Ring {
            buf: vec![T::default(); capacity * frame_len],
            frame_len,
            capacity,
            head: 0,
            used: 0,
        }
    }

    /// Appends `frames` silent (default-valued) frames.
    ///
    /// Only the contiguous free run is written, so callers must make sure it
    /// is long enough.
    pub fn push_silence(&mut self, frames: usize) {
        debug_assert!(
            frames <= self.free_contig(),
            "silence of {frames} frames exceeds contiguous free run {}",
            self.free_contig()
        );
        let n = frames * self.frame_len;
        self.tail_mut()[..n].fill(T::default());
        self.push(frames);
    }

    /// Copies frames from `src` into the ring, wrapping as needed.
    ///
    /// `src` must hold whole frames. Returns the number of frames written,
    /// which is less than requested only when the ring fills up.
    pub fn write(&mut self, src: &[T]) -> usize {
        debug_assert_eq!(src.len() % self.frame_len, 0);
        let mut written = 0;
        let total = src.len() / self.frame_len;
        while written < total {
            let n = self.free_contig().min(total - written);
            if n == 0 {
                break;
            }
            let (from, len) = (written * self.frame_len, n * self.frame_len);
            self.tail_mut()[..len].copy_from_slice(&src[from..from + len]);
            self.push(n);
            written += n;
        }
        written
    }

    /// Copies frames out of the ring into `dst`, wrapping as needed.
    ///
    /// Returns the number of frames read.
    pub fn read(&mut self, dst: &mut [T]) -> usize {
        debug_assert_eq!(dst.len() % self.frame_len, 0);
        let mut read = 0;
        let total = dst.len() / self.frame_len;
        while read < total {
            let n = self.used_contig().min(total - read);
            if n == 0 {
                break;
            }
            let (to, len) = (read * self.frame_len, n * self.frame_len);
            dst[to..to + len].copy_from_slice(&self.head()[..len]);
            self.take(n);
            read += n;
        }
        read
    }
}

impl<T> Ring<T> {
    /// Returns the capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of elements per frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Returns the number of frames currently stored.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the number of free frames.
    pub fn free(&self) -> usize {
        self.capacity - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    /// Returns the read cursor in frames.
    pub fn head_index(&self) -> usize {
        self.head
    }

    /// Returns the write cursor in frames.
    pub fn tail_index(&self) -> usize {
        if self.capacity == 0 {
            0
        } else {
            (self.head + self.used) % self.capacity
        }
    }

    /// Returns the number of used frames readable before storage wraps.
    pub fn used_contig(&self) -> usize {
        if self.head + self.used <= self.capacity {
            self.used
        } else {
            self.capacity - self.head
        }
    }

    /// Returns the number of free frames writable before storage wraps.
    pub fn free_contig(&self) -> usize {
        if self.head + self.used < self.capacity {
            self.capacity - (self.head + self.used)
        } else {
            self.capacity - self.used
        }
    }

    /// Returns the contiguous readable run starting at the read cursor.
    pub fn head(&self) -> &[T] {
        let start = self.head * self.frame_len;
        &self.buf[start..start + self.used_contig() * self.frame_len]
    }

    /// Returns the contiguous writable run starting at the write cursor.
    pub fn tail_mut(&mut self) -> &mut [T] {
        let start = self.tail_index() * self.frame_len;
        let len = self.free_contig() * self.frame_len;
        &mut self.buf[start..start + len]
    }

    /// Commits `frames` frames already copied into [`Ring::tail_mut`].
    pub fn push(&mut self, frames: usize) {
        debug_assert!(
            frames <= self.free(),
            "push of {frames} frames overruns ring ({}/{})",
            self.used,
            self.capacity
        );
        self.used += frames;
    }

    /// Releases `frames` frames from the read cursor.
    pub fn take(&mut self, frames: usize) {
        debug_assert!(
            frames <= self.used,
            "take of {frames} frames underruns ring ({}/{})",
            self.used,
            self.capacity
        );
        if self.capacity > 0 {
            self.head = (self.head + frames) % self.capacity;
        }
        self.used -= frames;
    }

    /// Drops all content and moves the cursor back to the start of storage.
    pub fn clear(&mut self) {
        self.head = 0;
        self.used = 0;
    }

    /// Moves the cursor of an empty ring back to the start of storage.
    pub fn rewind(&mut self) {
        debug_assert_eq!(self.used, 0, "rewind of a non-empty ring");
        self.head = 0;
    }
}
