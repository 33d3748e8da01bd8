//! Capture sources: what a stream records from.
//!
//! [`CaptureSource`] is the capability set the pipeline needs from any
//! recordable thing. The three adapters bridge it to the compositor scene:
//! outputs and windows are fed through the [`OutputFrames`] /
//! [`WindowFrames`] traits the embedder implements, and [`RegionSource`]
//! composites several outputs into one texture.

use std::fmt;

use drm_fourcc::DrmFourcc;
use smallvec::smallvec;

use crate::utils::{Clock, Monotonic, Point, Rectangle, Size, Time};

use super::frame::{CursorBitmap, DamageList};
use super::pool::CaptureBuffer;
use super::stream::StreamError;

/// Cursor state at one instant, in global coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub position: Point<i32>,
    pub hotspot: Point<i32>,
    /// Current cursor image; `None` when the backend cannot provide one.
    pub bitmap: Option<CursorBitmap>,
}

/// Everything the pipeline needs from a recordable source.
pub trait CaptureSource: fmt::Debug {
    /// Native frame rate in mHz.
    fn refresh_rate(&self) -> u32;

    /// Size of the produced texture in pixels.
    fn texture_size(&self) -> Size<i32>;

    /// Whether produced pixels carry meaningful alpha.
    fn has_alpha(&self) -> bool;

    /// Native pixel format.
    fn pixel_format(&self) -> DrmFourcc {
        if self.has_alpha() {
            DrmFourcc::Argb8888
        } else {
            DrmFourcc::Xrgb8888
        }
    }

    /// Advance the internal clock and return the timestamp of the newest
    /// producible frame. Frozen while paused.
    fn clock(&mut self) -> Time<Monotonic>;

    /// Damage accumulated since the previous call, in texture coordinates.
    /// Consumes the accumulated state.
    fn next_damage(&mut self) -> DamageList;

    /// Render the damaged parts into `target`. `cursor` is set when the
    /// cursor must be composited into the pixels (embedded mode).
    fn render(
        &mut self,
        target: &mut CaptureBuffer,
        damage: &[Rectangle<i32>],
        cursor: Option<&CursorSnapshot>,
    ) -> Result<(), StreamError>;

    fn pause(&mut self) {}
    fn resume(&mut self) {}

    /// Whether the global cursor position falls into the captured area.
    fn includes_cursor(&self, position: Point<i32>) -> bool;

    /// Translate a global cursor position into texture coordinates.
    fn map_cursor(&self, position: Point<i32>) -> Point<i32>;

    /// The captured thing is gone; the stream closes on the next tick.
    fn closed(&self) -> bool;
}

/// Scene feed for one output, implemented by the embedder.
pub trait OutputFrames: fmt::Debug {
    /// Output geometry in global compositor coordinates.
    fn geometry(&self) -> Rectangle<i32>;

    /// Refresh rate in mHz.
    fn refresh_rate(&self) -> u32;

    fn has_alpha(&self) -> bool {
        false
    }

    /// Damage since the previous call, global coordinates, consumed.
    fn take_damage(&mut self) -> DamageList;

    /// Copy the global-coordinate region `src` into `target` with its
    /// top-left at `dst`. `src` is fully inside [`geometry`](Self::geometry).
    fn render_section(
        &mut self,
        target: &mut CaptureBuffer,
        src: Rectangle<i32>,
        dst: Point<i32>,
        cursor: Option<&CursorSnapshot>,
    ) -> Result<(), StreamError>;

    fn alive(&self) -> bool {
        true
    }
}

/// Scene feed for one window, implemented by the embedder. Renders the
/// window with decorations and sub-surfaces.
pub trait WindowFrames: fmt::Debug {
    fn size(&self) -> Size<i32>;

    /// Refresh rate in mHz.
    fn refresh_rate(&self) -> u32;

    /// Window geometry in global coordinates, for cursor containment.
    fn geometry(&self) -> Rectangle<i32>;

    /// Damage since the previous call, window-local, consumed.
    fn take_damage(&mut self) -> DamageList;

    fn render(
        &mut self,
        target: &mut CaptureBuffer,
        damage: &[Rectangle<i32>],
        cursor: Option<&CursorSnapshot>,
    ) -> Result<(), StreamError>;

    fn alive(&self) -> bool;
}

/// Captures one output by forwarding its backend-rendered frames.
#[derive(Debug)]
pub struct OutputSource {
    output: Box<dyn OutputFrames>,
    clock: Clock<Monotonic>,
    last: Time<Monotonic>,
    paused: bool,
}

impl OutputSource {
    pub fn new(output: Box<dyn OutputFrames>) -> Self {
        let clock = Clock::new();
        let last = clock.now();
        OutputSource {
            output,
            clock,
            last,
            paused: false,
        }
    }
}

impl CaptureSource for OutputSource {
    fn refresh_rate(&self) -> u32 {
        self.output.refresh_rate()
    }

    fn texture_size(&self) -> Size<i32> {
        self.output.geometry().size
    }

    fn has_alpha(&self) -> bool {
        self.output.has_alpha()
    }

    fn clock(&mut self) -> Time<Monotonic> {
        if !self.paused {
            self.last = self.clock.now();
        }
        self.last
    }

    fn next_damage(&mut self) -> DamageList {
        let origin = self.output.geometry().loc;
        self.output
            .take_damage()
            .into_iter()
            .map(|rect| Rectangle::new(rect.loc - origin, rect.size))
            .collect()
    }

    fn render(
        &mut self,
        target: &mut CaptureBuffer,
        damage: &[Rectangle<i32>],
        cursor: Option<&CursorSnapshot>,
    ) -> Result<(), StreamError> {
        let geometry = self.output.geometry();
        for rect in damage {
            let src = Rectangle::new(rect.loc + geometry.loc, rect.size);
            self.output.render_section(target, src, rect.loc, cursor)?;
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn includes_cursor(&self, position: Point<i32>) -> bool {
        self.output.geometry().contains(position)
    }

    fn map_cursor(&self, position: Point<i32>) -> Point<i32> {
        position - self.output.geometry().loc
    }

    fn closed(&self) -> bool {
        !self.output.alive()
    }
}

/// Captures one window, wherever it is on screen.
#[derive(Debug)]
pub struct WindowSource {
    window: Box<dyn WindowFrames>,
    clock: Clock<Monotonic>,
    last: Time<Monotonic>,
    paused: bool,
}

impl WindowSource {
    pub fn new(window: Box<dyn WindowFrames>) -> Self {
        let clock = Clock::new();
        let last = clock.now();
        WindowSource {
            window,
            clock,
            last,
            paused: false,
        }
    }
}

impl CaptureSource for WindowSource {
    fn refresh_rate(&self) -> u32 {
        self.window.refresh_rate()
    }

    fn texture_size(&self) -> Size<i32> {
        self.window.size()
    }

    fn has_alpha(&self) -> bool {
        true
    }

    fn clock(&mut self) -> Time<Monotonic> {
        if !self.paused {
            self.last = self.clock.now();
        }
        self.last
    }

    fn next_damage(&mut self) -> DamageList {
        self.window.take_damage()
    }

    fn render(
        &mut self,
        target: &mut CaptureBuffer,
        damage: &[Rectangle<i32>],
        cursor: Option<&CursorSnapshot>,
    ) -> Result<(), StreamError> {
        self.window.render(target, damage, cursor)
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn includes_cursor(&self, position: Point<i32>) -> bool {
        self.window.geometry().contains(position)
    }

    fn map_cursor(&self, position: Point<i32>) -> Point<i32> {
        position - self.window.geometry().loc
    }

    fn closed(&self) -> bool {
        !self.window.alive()
    }
}

/// Composites the intersection of several outputs with a global-coordinate
/// rect into one texture at a fixed scale. Pixels no output covers stay
/// transparent.
#[derive(Debug)]
pub struct RegionSource {
    rect: Rectangle<i32>,
    scale: f64,
    outputs: Vec<Box<dyn OutputFrames>>,
    first_frame: bool,
    clock: Clock<Monotonic>,
    last: Time<Monotonic>,
    paused: bool,
}

impl RegionSource {
    pub fn new(rect: Rectangle<i32>, scale: f64, outputs: Vec<Box<dyn OutputFrames>>) -> Self {
        let clock = Clock::new();
        let last = clock.now();
        RegionSource {
            rect,
            scale,
            outputs,
            first_frame: true,
            clock,
            last,
            paused: false,
        }
    }

    fn scaled(&self, v: i32) -> i32 {
        scaled(self.scale, v)
    }
}

fn scaled(scale: f64, v: i32) -> i32 {
    (f64::from(v) * scale).round() as i32
}

/// Map a global-coordinate rect into texture coordinates of the captured
/// `region`. Free-standing so it stays callable while the output list is
/// mutably borrowed.
fn to_texture(region: Rectangle<i32>, scale: f64, rect: Rectangle<i32>) -> Rectangle<i32> {
    Rectangle::new(
        (
            scaled(scale, rect.loc.x - region.loc.x),
            scaled(scale, rect.loc.y - region.loc.y),
        ),
        (scaled(scale, rect.size.w), scaled(scale, rect.size.h)),
    )
}

impl CaptureSource for RegionSource {
    fn refresh_rate(&self) -> u32 {
        self.outputs
            .iter()
            .map(|o| o.refresh_rate())
            .max()
            .unwrap_or(60_000)
    }

    fn texture_size(&self) -> Size<i32> {
        Size::from((self.scaled(self.rect.size.w), self.scaled(self.rect.size.h)))
    }

    fn has_alpha(&self) -> bool {
        true
    }

    fn clock(&mut self) -> Time<Monotonic> {
        if !self.paused {
            self.last = self.clock.now();
        }
        self.last
    }

    fn next_damage(&mut self) -> DamageList {
        let (region, scale) = (self.rect, self.scale);
        let mut damage = DamageList::new();
        for output in &mut self.outputs {
            for rect in output.take_damage() {
                if let Some(sect) = rect.intersection(&region) {
                    damage.push(to_texture(region, scale, sect));
                }
            }
        }
        if self.first_frame {
            // The first frame renders everything regardless of what the
            // outputs reported so far.
            return smallvec![Rectangle::from_size(self.texture_size())];
        }
        damage
    }

    fn render(
        &mut self,
        target: &mut CaptureBuffer,
        damage: &[Rectangle<i32>],
        cursor: Option<&CursorSnapshot>,
    ) -> Result<(), StreamError> {
        if self.first_frame {
            // Uncovered pixels must read transparent.
            if let Some(data) = target.shm_data_mut() {
                data.fill(0);
            }
        }
        let (region, scale) = (self.rect, self.scale);
        for output in &mut self.outputs {
            let Some(sect) = output.geometry().intersection(&region) else {
                continue;
            };
            let dst = to_texture(region, scale, sect);
            let touched = self.first_frame || damage.iter().any(|d| d.overlaps(&dst));
            if touched {
                output.render_section(target, sect, dst.loc, cursor)?;
            }
        }
        self.first_frame = false;
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn includes_cursor(&self, position: Point<i32>) -> bool {
        self.rect.contains(position)
    }

    fn map_cursor(&self, position: Point<i32>) -> Point<i32> {
        let local = position - self.rect.loc;
        Point::from((self.scaled(local.x), self.scaled(local.y)))
    }

    fn closed(&self) -> bool {
        self.outputs.iter().all(|o| !o.alive())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::capture::pool::{BufferBacking, BufferPool};

    #[derive(Debug)]
    struct OutputScript {
        geometry: Rectangle<i32>,
        pending: DamageList,
        fill: u8,
    }

    #[derive(Debug)]
    struct ScriptedOutput(Rc<RefCell<OutputScript>>);

    fn scripted(geometry: Rectangle<i32>, fill: u8) -> (Box<dyn OutputFrames>, Rc<RefCell<OutputScript>>) {
        let script = Rc::new(RefCell::new(OutputScript {
            geometry,
            pending: DamageList::new(),
            fill,
        }));
        (Box::new(ScriptedOutput(script.clone())), script)
    }

    impl OutputFrames for ScriptedOutput {
        fn geometry(&self) -> Rectangle<i32> {
            self.0.borrow().geometry
        }

        fn refresh_rate(&self) -> u32 {
            60_000
        }

        fn take_damage(&mut self) -> DamageList {
            std::mem::take(&mut self.0.borrow_mut().pending)
        }

        fn render_section(
            &mut self,
            target: &mut CaptureBuffer,
            src: Rectangle<i32>,
            dst: Point<i32>,
            _cursor: Option<&CursorSnapshot>,
        ) -> Result<(), StreamError> {
            let fill = self.0.borrow().fill;
            let stride = target.stride() as usize;
            let data = target.shm_data_mut().unwrap();
            for row in 0..src.size.h {
                let y = (dst.y + row) as usize;
                let from = y * stride + dst.x as usize * 4;
                let to = from + src.size.w as usize * 4;
                data[from..to].fill(fill);
            }
            Ok(())
        }
    }

    fn region_with_two_outputs() -> (RegionSource, Rc<RefCell<OutputScript>>, Rc<RefCell<OutputScript>>) {
        let (o1, s1) = scripted(Rectangle::new((0, 0), (200, 200)), 0xaa);
        let (o2, s2) = scripted(Rectangle::new((200, 0), (200, 200)), 0xbb);
        let source = RegionSource::new(Rectangle::new((0, 0), (100, 100)), 1.0, vec![o1, o2]);
        (source, s1, s2)
    }

    fn buffer_for(source: &RegionSource) -> (BufferPool, crate::capture::BufferId) {
        let size = source.texture_size();
        let stride = (size.w * 4) as u32;
        let mut pool = BufferPool::new();
        let id = pool.add_buffer(
            BufferBacking::Shm {
                data: vec![0xff; (size.w * size.h * 4) as usize],
            },
            size,
            stride,
            DrmFourcc::Argb8888,
        );
        (pool, id)
    }

    #[test]
    fn first_frame_is_full() {
        let (mut source, _s1, _s2) = region_with_two_outputs();
        let damage = source.next_damage();
        assert_eq!(damage.as_slice(), &[Rectangle::new((0, 0), (100, 100))]);
    }

    #[test]
    fn damage_is_intersected_after_first_frame() {
        let (mut source, s1, s2) = region_with_two_outputs();
        let (mut pool, id) = buffer_for(&source);
        let damage = source.next_damage();
        source
            .render(pool.get_mut(id).unwrap(), &damage, None)
            .unwrap();

        // Damage on the second output misses the rect entirely; only a
        // sliver of the first output's damage lands inside.
        s2.borrow_mut().pending = smallvec![Rectangle::new((250, 0), (10, 10))];
        s1.borrow_mut().pending = smallvec![Rectangle::new((50, 50), (200, 10))];
        let damage = source.next_damage();
        assert_eq!(damage.as_slice(), &[Rectangle::new((50, 50), (50, 10))]);
    }

    #[test]
    fn uncovered_pixels_are_transparent() {
        let (mut source, s1, _s2) = region_with_two_outputs();
        // Shrink coverage: only the left half of the rect is covered.
        s1.borrow_mut().geometry = Rectangle::new((0, 0), (50, 100));
        let (mut pool, id) = buffer_for(&source);
        let damage = source.next_damage();
        source
            .render(pool.get_mut(id).unwrap(), &damage, None)
            .unwrap();
        let data = pool.get(id).unwrap().shm_data().unwrap();
        // Covered pixel, first output fill value.
        assert_eq!(data[0], 0xaa);
        // Uncovered pixel on the right half, cleared to transparent.
        let right = 99 * 4;
        assert_eq!(data[right], 0x00);
    }
}
