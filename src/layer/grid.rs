//! Tile grid enumeration.
//!
//! Tiles are visited in a fixed nested order: channel block outermost,
//! then height block, then width block. Advancing a coordinate works like
//! an odometer: the width digit ticks, and wrapping carries into height,
//! then into channel.
//!
//! ```text
//! grid 2 x 2 x 1:   (c0,h0) -> (c0,h1) -> (c1,h0) -> (c1,h1)
//! ```

/// Coordinate of one tile in the loop nest.
///
/// Depthwise layers pair every output channel with its own input channel,
/// so `in_channel` always moves together with `out_channel`. Both are kept
/// because the weight-reuse decision compares the pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub out_channel: usize,
    pub in_channel: usize,
    pub height: usize,
    pub width: usize,
}

impl TileCoord {
    /// The first tile of every grid.
    pub const ORIGIN: TileCoord = TileCoord { out_channel: 0, in_channel: 0, height: 0, width: 0 };

    /// Coordinate from a channel, height and width block index.
    pub fn new(channel: usize, height: usize, width: usize) -> Self {
        Self { out_channel: channel, in_channel: channel, height, width }
    }

    /// (output-channel block, input-channel block) pair selecting the weights.
    #[inline]
    pub fn channel_pair(&self) -> (usize, usize) {
        (self.out_channel, self.in_channel)
    }

    /// Whether `other` needs a different weight tile than `self`.
    #[inline]
    pub fn changes_channel_block(&self, other: &TileCoord) -> bool {
        self.channel_pair() != other.channel_pair()
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(c{}, h{}, w{})", self.out_channel, self.height, self.width)
    }
}

/// Boundary flags telling the kernel which sides to zero-pad.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PaddingFlags {
    pub top: bool,
    pub bottom: bool,
    pub left: bool,
    pub right: bool,
}

impl PaddingFlags {
    /// No side touches the tensor boundary.
    pub fn is_interior(&self) -> bool {
        !(self.top || self.bottom || self.left || self.right)
    }
}

/// Grid sizes per loop dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDims {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl GridDims {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }

    /// Total number of tiles.
    #[inline]
    pub fn total(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Next coordinate in loop order, `None` past the last tile.
    pub fn next(&self, coord: TileCoord) -> Option<TileCoord> {
        let mut next = coord;

        next.width += 1;
        if next.width < self.width {
            return Some(next);
        }
        next.width = 0;

        next.height += 1;
        if next.height < self.height {
            return Some(next);
        }
        next.height = 0;

        next.out_channel += 1;
        next.in_channel += 1;
        if next.out_channel < self.channels {
            return Some(next);
        }
        None
    }

    /// Position of a coordinate in loop order.
    pub fn index_of(&self, coord: TileCoord) -> usize {
        (coord.out_channel * self.height + coord.height) * self.width + coord.width
    }

    /// Coordinate at a position in loop order.
    pub fn coord_at(&self, index: usize) -> TileCoord {
        let width = index % self.width;
        let height = (index / self.width) % self.height;
        let channel = index / (self.width * self.height);
        TileCoord::new(channel, height, width)
    }

    /// Whether `coord` is the last tile of the grid.
    pub fn is_last(&self, coord: TileCoord) -> bool {
        self.next(coord).is_none()
    }

    /// Padding flags for a tile: first/last position along each spatial axis.
    pub fn padding_flags(&self, coord: TileCoord) -> PaddingFlags {
        PaddingFlags {
            top: coord.height == 0,
            bottom: coord.height + 1 == self.height,
            left: coord.width == 0,
            right: coord.width + 1 == self.width,
        }
    }

    /// Iterate over every coordinate in loop order.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let first = if self.total() == 0 { None } else { Some(TileCoord::ORIGIN) };
        std::iter::successors(first, move |c| self.next(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_odometer_order() {
        let grid = GridDims::new(2, 2, 1);
        let coords: Vec<TileCoord> = grid.iter().collect();

        assert_eq!(coords, vec![
            TileCoord::new(0, 0, 0),
            TileCoord::new(0, 1, 0),
            TileCoord::new(1, 0, 0),
            TileCoord::new(1, 1, 0),
        ]);
    }

    #[test]
    fn test_width_is_innermost() {
        let grid = GridDims::new(1, 2, 3);
        let coords: Vec<(usize, usize)> = grid.iter().map(|c| (c.height, c.width)).collect();

        assert_eq!(coords, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_channel_pair_moves_together() {
        let grid = GridDims::new(3, 1, 1);
        for coord in grid.iter() {
            assert_eq!(coord.out_channel, coord.in_channel);
        }
        let a = TileCoord::new(0, 0, 0);
        assert!(a.changes_channel_block(&TileCoord::new(1, 0, 0)));
        assert!(!a.changes_channel_block(&TileCoord::new(0, 3, 2)));
    }

    #[test]
    fn test_padding_flags_interior() {
        let grid = GridDims::new(1, 3, 3);
        let flags = grid.padding_flags(TileCoord::new(0, 1, 1));
        assert!(flags.is_interior());

        let corner = grid.padding_flags(TileCoord::new(0, 0, 2));
        assert_eq!(corner, PaddingFlags { top: true, bottom: false, left: false, right: true });
    }

    #[test]
    fn test_padding_flags_single_tile_axis() {
        let grid = GridDims::new(4, 1, 1);
        let flags = grid.padding_flags(TileCoord::new(2, 0, 0));
        assert_eq!(flags, PaddingFlags { top: true, bottom: true, left: true, right: true });
    }

    #[test]
    fn test_last_tile() {
        let grid = GridDims::new(2, 2, 2);
        assert!(grid.is_last(TileCoord::new(1, 1, 1)));
        assert!(!grid.is_last(TileCoord::new(1, 1, 0)));
    }

    proptest! {
        #[test]
        fn prop_iteration_visits_every_tile_once(c in 1usize..5, h in 1usize..5, w in 1usize..5) {
            let grid = GridDims::new(c, h, w);
            let coords: Vec<TileCoord> = grid.iter().collect();

            prop_assert_eq!(coords.len(), grid.total());
            for (i, coord) in coords.iter().enumerate() {
                prop_assert_eq!(grid.index_of(*coord), i);
                prop_assert_eq!(grid.coord_at(i), *coord);
            }
        }

        #[test]
        fn prop_padding_flags_follow_position(c in 1usize..4, h in 1usize..6, w in 1usize..6) {
            let grid = GridDims::new(c, h, w);
            for coord in grid.iter() {
                let flags = grid.padding_flags(coord);
                prop_assert_eq!(flags.top, coord.height == 0);
                prop_assert_eq!(flags.bottom, coord.height == h - 1);
                prop_assert_eq!(flags.left, coord.width == 0);
                prop_assert_eq!(flags.right, coord.width == w - 1);
                if h == 1 {
                    prop_assert!(flags.top && flags.bottom);
                }
                if w == 1 {
                    prop_assert!(flags.left && flags.right);
                }
            }
        }
    }
}
