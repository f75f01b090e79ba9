use std::str::FromStr;

use nalgebra::{matrix, SMatrix};
use tracing::debug;

use crate::{
    config::SimulationConfig,
    datatypes::{Boundary, BoundaryRegion, Element, Node, Vertex, DOF},
    error::{FeaError, Result},
};

/// How each quadrilateral cell of the structured grid is split into triangles.
///
/// With corners `v0` (bottom-left), `v1` (bottom-right), `v2` (top-left) and
/// `v3` (top-right), `Left` cuts along `v1`-`v2` and `Right` along `v0`-`v3`.
/// The alternating variants switch convention on every row of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagonal {
    Left,
    Right,
    /// Even rows `Left`, odd rows `Right`.
    RightLeft,
    /// Even rows `Right`, odd rows `Left`.
    LeftRight,
}

impl Diagonal {
    fn for_row(self, row: usize) -> Diagonal {
        match self {
            Diagonal::RightLeft if row % 2 == 1 => Diagonal::Right,
            Diagonal::RightLeft => Diagonal::Left,
            Diagonal::LeftRight if row % 2 == 1 => Diagonal::Left,
            Diagonal::LeftRight => Diagonal::Right,
            fixed => fixed,
        }
    }
}

impl FromStr for Diagonal {
    type Err = FeaError;

    fn from_str(s: &str) -> Result<Diagonal> {
        match s {
            "left" => Ok(Diagonal::Left),
            "right" => Ok(Diagonal::Right),
            "right/left" => Ok(Diagonal::RightLeft),
            "left/right" => Ok(Diagonal::LeftRight),
            other => Err(FeaError::Input(format!(
                "Unrecognized mesh diagonal '{other}'"
            ))),
        }
    }
}

/// Structured triangulation of the rectangular domain.
///
/// Nodes are numbered row-major from the bottom-left corner; cell `(i, j)`
/// owns elements `2 * (j * divisions + i)` and the one after it.
#[derive(Debug, Clone)]
pub struct DomainMesh {
    pub nodes: Vec<Node>,
    pub elements: Vec<Element>,
    boundary_edges: Vec<[usize; 2]>,
    divisions: usize,
    lower: Vertex,
    upper: Vertex,
}

impl DomainMesh {
    /// Builds the mesh with `divisions` cells per side
    ///
    /// # Arguments
    /// * `config` - Supplies the domain corners and diagonal convention
    /// * `divisions` - Number of cells along each side
    ///
    /// # Returns
    /// A mesh with `(divisions + 1)^2` nodes and `2 * divisions^2` triangles
    pub fn structured(config: &SimulationConfig, divisions: usize) -> Result<DomainMesh> {
        if divisions == 0 {
            return Err(FeaError::Mesher(
                "mesh needs at least one division per side".to_owned(),
            ));
        }

        let lower = config.lower;
        let upper = config.upper;
        let n = divisions;
        let hx = (upper.x - lower.x) / n as f64;
        let hy = (upper.y - lower.y) / n as f64;

        let mut nodes: Vec<Node> = Vec::with_capacity((n + 1) * (n + 1));
        for iy in 0..=n {
            for ix in 0..=n {
                // snap the last row/column onto the corner to avoid round-off
                let x = if ix == n { upper.x } else { lower.x + ix as f64 * hx };
                let y = if iy == n { upper.y } else { lower.y + iy as f64 * hy };

                // Dirichlet edges are the first and last grid rows only
                let boundary = if iy == 0 {
                    Some(Boundary::Bottom)
                } else if iy == n {
                    Some(Boundary::Top)
                } else {
                    None
                };

                nodes.push(Node {
                    vertex: Vertex::new(x, y),
                    boundary,
                });
            }
        }

        let mut elements: Vec<Element> = Vec::with_capacity(2 * n * n);
        for iy in 0..n {
            let diagonal = config.diagonal.for_row(iy);
            for ix in 0..n {
                let v0 = iy * (n + 1) + ix;
                let v1 = v0 + 1;
                let v2 = v0 + (n + 1);
                let v3 = v1 + (n + 1);

                match diagonal {
                    Diagonal::Left => {
                        elements.push(Element { nodes: [v0, v1, v2] });
                        elements.push(Element { nodes: [v1, v3, v2] });
                    }
                    _ => {
                        elements.push(Element { nodes: [v0, v1, v3] });
                        elements.push(Element { nodes: [v0, v3, v2] });
                    }
                }
            }
        }

        let mut boundary_edges: Vec<[usize; 2]> = Vec::with_capacity(4 * n);
        for i in 0..n {
            boundary_edges.push([i, i + 1]); // bottom
            boundary_edges.push([n * (n + 1) + i, n * (n + 1) + i + 1]); // top
            boundary_edges.push([i * (n + 1), (i + 1) * (n + 1)]); // left
            boundary_edges.push([i * (n + 1) + n, (i + 1) * (n + 1) + n]); // right
        }

        debug!(
            "built structured mesh with {} nodes and {} elements",
            nodes.len(),
            elements.len()
        );

        Ok(DomainMesh {
            nodes,
            elements,
            boundary_edges,
            divisions,
            lower,
            upper,
        })
    }

    pub fn divisions(&self) -> usize {
        self.divisions
    }

    pub fn lower(&self) -> Vertex {
        self.lower
    }

    pub fn upper(&self) -> Vertex {
        self.upper
    }

    pub fn dof_count(&self) -> usize {
        DOF * self.nodes.len()
    }

    /// Node pairs forming the outer boundary of the domain.
    pub fn boundary_edges(&self) -> &[[usize; 2]] {
        &self.boundary_edges
    }

    /// Indices of the nodes lying inside `region`.
    pub fn nodes_in<'a>(&'a self, region: &'a BoundaryRegion) -> impl Iterator<Item = usize> + 'a {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| region.contains(&node.vertex))
            .map(|(i, _)| i)
    }

    fn vertices(&self, element: &Element) -> [Vertex; 3] {
        element.nodes.map(|i| self.nodes[i].vertex)
    }

    /// Calculates the signed area of the element (positive when counter-clockwise)
    pub fn element_area(&self, element: &Element) -> f64 {
        let [v0, v1, v2] = self.vertices(element);

        0.5 * (v0.x * (v1.y - v2.y) + v1.x * (v2.y - v0.y) + v2.x * (v0.y - v1.y))
    }

    pub fn centroid(&self, element: &Element) -> Vertex {
        let [v0, v1, v2] = self.vertices(element);
        Vertex::new((v0.x + v1.x + v2.x) / 3.0, (v0.y + v1.y + v2.y) / 3.0)
    }

    /// Calculates the gradients of the three linear shape functions
    ///
    /// # Arguments
    /// * `element` - The Element to target
    ///
    /// # Returns
    /// A 3x2 matrix whose row `a` is `[dN_a/dx, dN_a/dy]`
    pub fn shape_gradients(&self, element: &Element) -> SMatrix<f64, 3, 2> {
        let [v0, v1, v2] = self.vertices(element);
        let area = self.element_area(element);

        let beta_1 = v1.y - v2.y;
        let beta_2 = v2.y - v0.y;
        let beta_3 = v0.y - v1.y;

        let gamma_1 = v2.x - v1.x;
        let gamma_2 = v0.x - v2.x;
        let gamma_3 = v1.x - v0.x;

        let mut gradients: SMatrix<f64, 3, 2> = matrix![
            beta_1, gamma_1;
            beta_2, gamma_2;
            beta_3, gamma_3;
        ];

        gradients /= 2.0 * area;

        gradients
    }

    /// Barycentric coordinates of `point` with respect to `element`.
    pub fn barycentric(&self, element: &Element, point: Vertex) -> [f64; 3] {
        let [v0, v1, v2] = self.vertices(element);
        let det = (v1.y - v2.y) * (v0.x - v2.x) + (v2.x - v1.x) * (v0.y - v2.y);
        let l0 = ((v1.y - v2.y) * (point.x - v2.x) + (v2.x - v1.x) * (point.y - v2.y)) / det;
        let l1 = ((v2.y - v0.y) * (point.x - v2.x) + (v0.x - v2.x) * (point.y - v2.y)) / det;
        [l0, l1, 1.0 - l0 - l1]
    }

    /// Finds the element containing `point`
    ///
    /// # Returns
    /// The element index and the barycentric weights of `point` within it
    pub fn locate(&self, point: Vertex) -> Result<(usize, [f64; 3])> {
        let outside = !(point.x >= self.lower.x
            && point.x <= self.upper.x
            && point.y >= self.lower.y
            && point.y <= self.upper.y);
        if outside {
            return Err(FeaError::DomainQueryOutOfRange {
                x: point.x,
                y: point.y,
            });
        }

        let n = self.divisions;
        let cell = |p: f64, lo: f64, hi: f64| -> usize {
            let i = ((p - lo) / (hi - lo) * n as f64).floor() as usize;
            i.min(n - 1)
        };
        let ix = cell(point.x, self.lower.x, self.upper.x);
        let iy = cell(point.y, self.lower.y, self.upper.y);

        // of the cell's two triangles, take the one the point is least outside of
        let first = 2 * (iy * n + ix);
        let (index, weights) = [first, first + 1]
            .into_iter()
            .map(|e| (e, self.barycentric(&self.elements[e], point)))
            .max_by(|(_, a), (_, b)| {
                let min_a = a.iter().cloned().fold(f64::INFINITY, f64::min);
                let min_b = b.iter().cloned().fold(f64::INFINITY, f64::min);
                min_a.total_cmp(&min_b)
            })
            .ok_or(FeaError::DomainQueryOutOfRange {
                x: point.x,
                y: point.y,
            })?;

        Ok((index, weights))
    }
}
