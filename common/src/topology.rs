use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::environment::SessionInfo;
use crate::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub row: i32,
    pub col: i32,
}

impl Point {
    pub const OUTSIDE: Point = Point { row: -1, col: -1 };

    pub fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    South,
    East,
    West,
    /// Servidor de servicio externo colgado de la raíz
    External,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::External => Direction::External,
        }
    }
}

/// Servidor de tareas visto por el resto del overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborInfo {
    pub id: NodeId,
    pub point: Point,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    pub north: Option<NeighborInfo>,
    pub south: Option<NeighborInfo>,
    pub east: Option<NeighborInfo>,
    pub west: Option<NeighborInfo>,
}

/// Respuesta del Hsp al registrar un servidor de tareas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub me: NeighborInfo,
    pub neighbors: Neighbors,
    /// Sólo para servidores externos
    pub root: Option<NeighborInfo>,
    pub session: Option<SessionInfo>,
    pub providers: HashMap<String, NodeId>,
}

/// Aviso a un vecino existente: registrar `neighbor` en `direction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub target: NodeId,
    pub neighbor: NeighborInfo,
    pub direction: Direction,
}

/// Arma el toro 2D a medida que los servidores se registran.
#[derive(Debug, Default)]
pub struct TopologyManager {
    mesh: Vec<Vec<NeighborInfo>>,
    next: usize,
    root: Option<NeighborInfo>,
    external: Vec<NeighborInfo>,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&NeighborInfo> {
        self.root.as_ref()
    }

    pub fn len(&self) -> usize {
        self.mesh.iter().map(Vec::len).sum::<usize>() + self.external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Todos los servidores, malla primero por filas y luego externos.
    pub fn servers(&self) -> Vec<NeighborInfo> {
        self.mesh
            .iter()
            .flatten()
            .chain(self.external.iter())
            .cloned()
            .collect()
    }

    /// Ubica un servidor nuevo y devuelve su posición, sus vecinos y los
    /// avisos que hay que mandar a los vecinos ya existentes.
    pub fn add(
        &mut self,
        id: NodeId,
        service: Option<String>,
    ) -> (NeighborInfo, Neighbors, Option<NeighborInfo>, Vec<Notification>) {
        if service.is_some() {
            if let Some(root) = self.root.clone() {
                let me = NeighborInfo {
                    id,
                    point: Point::OUTSIDE,
                    service,
                };
                self.external.push(me.clone());
                let notice = Notification {
                    target: root.id.clone(),
                    neighbor: me.clone(),
                    direction: Direction::External,
                };
                return (me, Neighbors::default(), Some(root), vec![notice]);
            }
            // sin raíz todavía: entra a la malla como cualquier otro
        }

        let mut n = Neighbors::default();
        let rows = self.mesh.len();

        let (point, row) = if rows == 0 {
            (Point::new(0, 0), 0)
        } else {
            let first_len = self.mesh[0].len();
            let last_len = self.mesh[rows - 1].len();

            if rows == first_len && rows == last_len {
                // cuadrado: columna nueva en la fila 0
                let first = &self.mesh[0];
                n.east = Some(first[0].clone());
                n.west = Some(first[first_len - 1].clone());
                self.next = 1;
                (Point::new(0, first_len as i32), 0)
            } else if first_len > rows && first_len > last_len && rows > 1 {
                // completando la columna nueva hacia abajo
                let row = self.next;
                let north_row = &self.mesh[row - 1];
                let west_row = &self.mesh[row];
                n.east = Some(west_row[0].clone());
                n.south = Some(self.mesh[0][first_len - 1].clone());
                n.west = Some(west_row[west_row.len() - 1].clone());
                n.north = Some(north_row[north_row.len() - 1].clone());
                let point = Point::new(row as i32, west_row.len() as i32);
                self.next += 1;
                (point, row)
            } else if first_len == last_len {
                // fila nueva
                n.south = Some(self.mesh[0][0].clone());
                n.north = Some(self.mesh[rows - 1][0].clone());
                self.mesh.push(Vec::new());
                (Point::new(rows as i32, 0), rows)
            } else {
                // completar la última fila
                let last = &self.mesh[rows - 1];
                n.east = Some(last[0].clone());
                n.south = Some(self.mesh[0][last_len].clone());
                n.west = Some(last[last_len - 1].clone());
                n.north = Some(self.mesh[rows - 2][last_len].clone());
                (Point::new(rows as i32 - 1, last_len as i32), rows - 1)
            }
        };

        let me = NeighborInfo { id, point, service };
        if rows == 0 {
            self.mesh.push(Vec::new());
            self.root = Some(me.clone());
        }
        self.mesh[row].push(me.clone());

        let mut notices = Vec::new();
        for (neighbor, direction) in [
            (&n.east, Direction::West),
            (&n.south, Direction::North),
            (&n.west, Direction::East),
            (&n.north, Direction::South),
        ] {
            if let Some(info) = neighbor {
                notices.push(Notification {
                    target: info.id.clone(),
                    neighbor: me.clone(),
                    direction,
                });
            }
        }

        (me, n, None, notices)
    }
}
