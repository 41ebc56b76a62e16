/// A type-safe bounding box.
///
/// It is a wrapper around a tuple of four `f32` values representing the coordinates of the
/// bounding box. The type parameter `T` specifies the format of the bounding box, and is used
/// to enforce type safety. Coordinates are normalized to `[0, 1]` relative to the image height
/// and width, y before x.
///
/// # Conversion
///
/// The bounding box can be converted between formats using the [`ConvertBbox`] trait.
///
/// ```
/// use ssd::bbox::*;
///
/// let yxyx = Bbox::yxyx(0.2, 0.4, 0.6, 0.5);
/// let cyxhw: Bbox<Cyxhw> = yxyx.convert();
///
/// let (cy, cx, h, w) = cyxhw.inner;
/// assert!((cy - 0.4).abs() < 1e-6 && (cx - 0.45).abs() < 1e-6);
/// assert!((h - 0.4).abs() < 1e-6 && (w - 0.1).abs() < 1e-6);
/// ```
///
/// # Formats
///
/// The following formats are supported:
///
/// - [`Yxyx`] (ymin, xmin, ymax, xmax)
/// - [`Cyxhw`] (center_y, center_x, height, width)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox<T> {
    pub inner: (f32, f32, f32, f32),
    _marker: std::marker::PhantomData<T>,
}

impl<T> Bbox<T> {
    /// Create a new bounding box from the given coordinates.
    fn new(bbox: (f32, f32, f32, f32)) -> Self {
        Bbox {
            inner: bbox,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Bbox<T>
where
    Bbox<T>: ConvertBbox<Yxyx>,
{
    /// Compute the area of the bounding box.
    ///
    /// Inverted boxes have an area of `0.0`.
    pub fn area(&self) -> f32 {
        let (y1, x1, y2, x2) = ConvertBbox::<Yxyx>::convert(self).inner;
        (y2 - y1).max(0.0) * (x2 - x1).max(0.0)
    }

    /// Compute the intersection area between two bounding boxes.
    ///
    /// If the bounding boxes do not overlap, the intersection area is `0.0`.
    pub fn intersection<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Yxyx>,
    {
        let (y1, x1, y2, x2) = ConvertBbox::<Yxyx>::convert(self).inner;
        let (y3, x3, y4, x4) = other.convert().inner;

        let y1 = y1.max(y3);
        let x1 = x1.max(x3);
        let y2 = y2.min(y4);
        let x2 = x2.min(x4);

        if y2 < y1 || x2 < x1 {
            0.0
        } else {
            (y2 - y1) * (x2 - x1)
        }
    }

    /// Compute the union area between two bounding boxes.
    pub fn union<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Yxyx>,
    {
        self.area() + other.convert().area() - self.intersection(other)
    }

    /// Compute the intersection over union (IoU) between two bounding boxes.
    ///
    /// The IoU with a box without area is always `0.0`.
    pub fn iou<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Yxyx>,
    {
        let union = self.union(other);
        if union <= 0.0 {
            return 0.0;
        }

        self.intersection(other) / union
    }

    /// Compute the part of `self` that is covered by `other`, relative to the area of `self`.
    pub fn coverage_by<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Yxyx>,
    {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }

        self.intersection(other) / area
    }
}

impl<T> From<Bbox<T>> for (f32, f32, f32, f32) {
    fn from(bbox: Bbox<T>) -> Self {
        bbox.inner
    }
}

impl<T> From<Bbox<T>> for [f32; 4] {
    fn from(bbox: Bbox<T>) -> Self {
        let (a, b, c, d) = bbox.inner;
        [a, b, c, d]
    }
}

/// Trait for converting a bounding box to a different representation.
pub trait ConvertBbox<T> {
    fn convert(&self) -> Bbox<T>;
}

/// Marker type for bounding boxes with the coordinates of the top-left and bottom-right
/// corners, y before x.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Yxyx;

impl Bbox<Yxyx> {
    /// Create a bounding box from the coordinates of the top-left and bottom-right corners.
    pub fn yxyx(ymin: f32, xmin: f32, ymax: f32, xmax: f32) -> Bbox<Yxyx> {
        Bbox::new((ymin, xmin, ymax, xmax))
    }

    /// The box covering the whole image.
    pub fn unit() -> Bbox<Yxyx> {
        Bbox::yxyx(0.0, 0.0, 1.0, 1.0)
    }

    pub fn ymin(&self) -> f32 {
        self.inner.0
    }

    pub fn xmin(&self) -> f32 {
        self.inner.1
    }

    pub fn ymax(&self) -> f32 {
        self.inner.2
    }

    pub fn xmax(&self) -> f32 {
        self.inner.3
    }

    /// Intersect the bounding box with `reference`, coordinate by coordinate.
    ///
    /// A box that does not overlap the reference collapses onto its border, leaving a box
    /// with zero area instead of an inverted one.
    #[must_use]
    pub fn clip(&self, reference: &Bbox<Yxyx>) -> Bbox<Yxyx> {
        let (ry1, rx1, ry2, rx2) = reference.inner;
        let (y1, x1, y2, x2) = self.inner;

        let y1 = y1.max(ry1).min(ry2);
        let x1 = x1.max(rx1).min(rx2);
        let y2 = y2.max(ry1).min(ry2).max(y1);
        let x2 = x2.max(rx1).min(rx2).max(x1);

        Bbox::new((y1, x1, y2, x2))
    }

    /// Express the bounding box in the frame of `reference`.
    ///
    /// This is the affine map that sends `reference` to the unit box, used when the image
    /// was padded or cropped before inference.
    #[must_use]
    pub fn resize(&self, reference: &Bbox<Yxyx>) -> Bbox<Yxyx> {
        let (ry1, rx1, ry2, rx2) = reference.inner;
        let (y1, x1, y2, x2) = self.inner;

        let height = ry2 - ry1;
        let width = rx2 - rx1;

        Bbox::new((
            (y1 - ry1) / height,
            (x1 - rx1) / width,
            (y2 - ry1) / height,
            (x2 - rx1) / width,
        ))
    }
}

impl ConvertBbox<Yxyx> for Bbox<Yxyx> {
    fn convert(&self) -> Bbox<Yxyx> {
        *self
    }
}

impl ConvertBbox<Cyxhw> for Bbox<Yxyx> {
    fn convert(&self) -> Bbox<Cyxhw> {
        let (y1, x1, y2, x2) = self.inner;
        Bbox::new(((y1 + y2) / 2.0, (x1 + x2) / 2.0, y2 - y1, x2 - x1))
    }
}

/// Marker type for bounding boxes with the coordinates of the center and the height and width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cyxhw;

impl Bbox<Cyxhw> {
    /// Create a bounding box from the coordinates of the center and the height and width.
    pub fn cyxhw(cy: f32, cx: f32, h: f32, w: f32) -> Bbox<Cyxhw> {
        Bbox::new((cy, cx, h, w))
    }
}

impl ConvertBbox<Yxyx> for Bbox<Cyxhw> {
    fn convert(&self) -> Bbox<Yxyx> {
        let (cy, cx, h, w) = self.inner;
        Bbox::new((cy - h / 2.0, cx - w / 2.0, cy + h / 2.0, cx + w / 2.0))
    }
}

impl ConvertBbox<Cyxhw> for Bbox<Cyxhw> {
    fn convert(&self) -> Bbox<Cyxhw> {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_yxyx() {
        let bbox1 = Bbox::yxyx(0.0, 0.0, 10.0, 10.0);
        let bbox2 = Bbox::yxyx(5.0, 5.0, 15.0, 15.0);

        assert_eq!(bbox1.intersection(&bbox2), 25.0);
        assert_eq!(bbox1.union(&bbox2), 175.0);
        assert_eq!(bbox1.iou(&bbox2), 25.0 / 175.0);
    }

    #[test]
    fn iou_cyxhw() {
        let bbox1 = Bbox::cyxhw(5.0, 5.0, 10.0, 10.0);
        let bbox2 = Bbox::cyxhw(10.0, 10.0, 10.0, 10.0);

        assert_eq!(bbox1.intersection(&bbox2), 25.0);
        assert_eq!(bbox1.union(&bbox2), 175.0);
        assert_eq!(bbox1.iou(&bbox2), 25.0 / 175.0);
    }

    #[test]
    fn iou_with_empty_box_is_zero() {
        let point = Bbox::yxyx(0.5, 0.5, 0.5, 0.5);
        let bbox = Bbox::yxyx(0.0, 0.0, 1.0, 1.0);

        assert_eq!(point.iou(&bbox), 0.0);
        assert_eq!(point.iou(&point), 0.0);
    }

    #[test]
    fn clip_never_inverts() {
        let reference = Bbox::unit();

        let inside = Bbox::yxyx(-0.2, 0.1, 0.5, 1.3).clip(&reference);
        assert_eq!(inside.inner, (0.0, 0.1, 0.5, 1.0));

        let outside = Bbox::yxyx(1.2, 1.1, 1.5, 1.4).clip(&reference);
        assert!(outside.ymin() <= outside.ymax());
        assert!(outside.xmin() <= outside.xmax());
        assert_eq!(outside.area(), 0.0);

        let inverted = Bbox::yxyx(0.8, 0.8, 0.2, 0.2).clip(&reference);
        assert!(inverted.ymin() <= inverted.ymax());
        assert_eq!(inverted.area(), 0.0);
    }

    #[test]
    fn resize_maps_reference_to_unit_box() {
        let reference = Bbox::yxyx(0.25, 0.0, 0.75, 0.5);

        assert_eq!(reference.resize(&reference).inner, (0.0, 0.0, 1.0, 1.0));

        let bbox = Bbox::yxyx(0.5, 0.25, 0.75, 0.5).resize(&reference);
        assert_eq!(bbox.inner, (0.5, 0.5, 1.0, 1.0));
    }

    #[test]
    fn coverage_is_relative_to_self() {
        let small = Bbox::yxyx(0.0, 0.0, 0.5, 0.5);
        let large = Bbox::unit();

        assert_eq!(small.coverage_by(&large), 1.0);
        assert_eq!(large.coverage_by(&small), 0.25);
    }
}
