use crate::topology::{Direction, NeighborInfo, Neighbors, Placement, Point};
use crate::NodeId;

/// Vecinos de un servidor de tareas y su lugar en el árbol de difusión.
///
/// El padre se fija al construir; los hijos se recalculan con cada vecino
/// nuevo.
#[derive(Debug, Clone)]
pub struct NeighborManager {
    me: NeighborInfo,
    north: Option<NeighborInfo>,
    south: Option<NeighborInfo>,
    east: Option<NeighborInfo>,
    west: Option<NeighborInfo>,
    root: Option<NeighborInfo>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    external_children: Vec<NodeId>,
}

impl NeighborManager {
    /// Servidor todavía sin registrar en el overlay.
    pub fn detached(me: NodeId) -> Self {
        Self::new(
            NeighborInfo {
                id: me,
                point: Point::OUTSIDE,
                service: None,
            },
            Neighbors::default(),
            None,
        )
    }

    pub fn from_placement(placement: &Placement) -> Self {
        Self::new(
            placement.me.clone(),
            placement.neighbors.clone(),
            placement.root.clone(),
        )
    }

    pub fn new(me: NeighborInfo, neighbors: Neighbors, root: Option<NeighborInfo>) -> Self {
        if let Some(root) = root {
            // externo: sólo conoce a la raíz
            let parent = Some(root.id.clone());
            return Self {
                me,
                north: None,
                south: None,
                east: None,
                west: None,
                root: Some(root),
                parent,
                children: Vec::new(),
                external_children: Vec::new(),
            };
        }

        let parent = if me.point.row == 0 {
            neighbors.west.as_ref().map(|w| w.id.clone())
        } else {
            neighbors.north.as_ref().map(|n| n.id.clone())
        };

        let mut manager = Self {
            me,
            north: neighbors.north,
            south: neighbors.south,
            east: neighbors.east,
            west: neighbors.west,
            root: None,
            parent,
            children: Vec::new(),
            external_children: Vec::new(),
        };
        manager.set_children();
        manager
    }

    fn set_children(&mut self) {
        let mut children = Vec::new();
        if self.me.point.row == 0 {
            if let Some(east) = &self.east {
                if east.point.col > self.me.point.col {
                    children.push(east.id.clone());
                }
            }
        }
        if let Some(south) = &self.south {
            if south.point.row > self.me.point.row && !children.contains(&south.id) {
                children.push(south.id.clone());
            }
        }
        self.children = children;
    }

    pub fn set_neighbor(&mut self, neighbor: NeighborInfo, direction: Direction) {
        match direction {
            Direction::North => self.north = Some(neighbor),
            Direction::South => self.south = Some(neighbor),
            Direction::East => self.east = Some(neighbor),
            Direction::West => self.west = Some(neighbor),
            Direction::External => {
                if !self.external_children.contains(&neighbor.id) {
                    self.external_children.push(neighbor.id);
                }
                return;
            }
        }
        self.set_children();
    }

    pub fn me(&self) -> &NeighborInfo {
        &self.me
    }

    pub fn point(&self) -> Point {
        self.me.point
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn is_external(&self) -> bool {
        self.root.is_some()
    }

    pub fn neighbor(&self, direction: Direction) -> Option<&NeighborInfo> {
        match direction {
            Direction::North => self.north.as_ref(),
            Direction::South => self.south.as_ref(),
            Direction::East => self.east.as_ref(),
            Direction::West => self.west.as_ref(),
            Direction::External => self.root.as_ref(),
        }
    }

    /// Hijos del árbol de difusión, externos incluidos.
    pub fn children(&self) -> Vec<NodeId> {
        self.children
            .iter()
            .chain(self.external_children.iter())
            .cloned()
            .collect()
    }

    /// Vecinos distintos (sin repetir nodos que ocupan dos direcciones).
    pub fn neighbors(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        for n in [&self.north, &self.south, &self.east, &self.west, &self.root]
            .into_iter()
            .flatten()
        {
            if n.id != self.me.id && !out.contains(&n.id) {
                out.push(n.id.clone());
            }
        }
        out
    }

    /// Vecinos + hijos externos: todo nodo al que llega un broadcast.
    pub fn all_peers(&self) -> Vec<NodeId> {
        let mut out = self.neighbors();
        for c in &self.external_children {
            if !out.contains(c) {
                out.push(c.clone());
            }
        }
        out
    }
}
