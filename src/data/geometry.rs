/// Axis aligned rectangle in map units (lon on x, lat on y).
///
/// A negative width marks the empty rectangle, which is what a bounding box
/// starts out as before any point is included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Default for DRect {
    fn default() -> Self {
        DRect::empty()
    }
}

impl DRect {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        DRect { x, y, w, h }
    }

    pub fn empty() -> Self {
        DRect { x: 0.0, y: 0.0, w: -1.0, h: 0.0 }
    }

    pub fn is_empty(&self) -> bool {
        self.w < 0.0
    }

    pub fn right(&self) -> f64 {
        self.x + self.w
    }

    pub fn top(&self) -> f64 {
        self.y + self.h
    }

    pub fn include(&mut self, x: f64, y: f64) {
        if self.is_empty() {
            *self = DRect::new(x, y, 0.0, 0.0);
            return;
        }
        if x < self.x {
            self.w += self.x - x;
            self.x = x;
        } else if x > self.right() {
            self.w = x - self.x;
        }
        if y < self.y {
            self.h += self.y - y;
            self.y = y;
        } else if y > self.top() {
            self.h = y - self.y;
        }
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &DRect) -> DRect {
        if other.is_empty() {
            return *self;
        }
        let mut ret = *self;
        ret.include(other.x, other.y);
        ret.include(other.right(), other.top());
        ret
    }

    pub fn intersection(&self, other: &DRect) -> DRect {
        if self.is_empty() || other.is_empty() {
            return DRect::empty();
        }
        if other.right() < self.x || other.top() < self.y || other.x > self.right() || other.y > self.top() {
            return DRect::empty();
        }
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        DRect::new(x, y, self.right().min(other.right()) - x, self.top().min(other.top()) - y)
    }

    pub fn overlaps(&self, other: &DRect) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Half open containment: the left/bottom edges belong to the rectangle,
    /// the right/top edges do not.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        !self.is_empty() && x >= self.x && x < self.right() && y >= self.y && y < self.top()
    }

    /// Closed containment, all four edges included.
    pub fn contains_closed(&self, x: f64, y: f64) -> bool {
        !self.is_empty() && x >= self.x && x <= self.right() && y >= self.y && y <= self.top()
    }

    /// Whether the segment (x1, y1)-(x2, y2) touches the closed rectangle.
    ///
    /// Liang-Barsky clipping: the segment is parametrised as p(t), t in [0, 1],
    /// and the parameter interval is narrowed against each of the four slabs.
    pub fn intersects_segment(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> bool {
        if self.is_empty() {
            return false;
        }
        let dx = x2 - x1;
        let dy = y2 - y1;
        let mut t0 = 0.0_f64;
        let mut t1 = 1.0_f64;

        let checks = [
            (-dx, x1 - self.x),
            (dx, self.right() - x1),
            (-dy, y1 - self.y),
            (dy, self.top() - y1),
        ];
        for (p, q) in checks {
            if p == 0.0 {
                // parallel to this slab
                if q < 0.0 {
                    return false;
                }
            } else {
                let r = q / p;
                if p < 0.0 {
                    if r > t1 {
                        return false;
                    }
                    t0 = t0.max(r);
                } else {
                    if r < t0 {
                        return false;
                    }
                    t1 = t1.min(r);
                }
            }
        }
        t0 <= t1
    }
}
