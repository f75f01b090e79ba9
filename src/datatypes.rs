/// Degrees of freedom per node (x and y displacement).
pub const DOF: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

impl Vertex {
    pub fn new(x: f64, y: f64) -> Vertex {
        Vertex { x, y }
    }
}

/// Which Dirichlet edge a node sits on, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Bottom,
    Top,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub vertex: Vertex,
    pub boundary: Option<Boundary>,
}

impl Node {
    /// Global dof index of the x and y displacement of node `index`.
    pub fn dofs(index: usize) -> [usize; DOF] {
        [DOF * index, DOF * index + 1]
    }
}

/// Linear triangle, nodes ordered counter-clockwise.
#[derive(Debug, Clone)]
pub struct Element {
    pub nodes: [usize; 3],
}

impl Element {
    pub fn dofs(&self) -> [usize; 3 * DOF] {
        let [a, b, c] = self.nodes;
        [
            DOF * a,
            DOF * a + 1,
            DOF * b,
            DOF * b + 1,
            DOF * c,
            DOF * c + 1,
        ]
    }
}

/// Axis-aligned open box used to select nodes near a boundary.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryRegion {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl BoundaryRegion {
    /// Everything strictly above `y`.
    pub fn above(y: f64) -> BoundaryRegion {
        BoundaryRegion {
            x_min: f64::MIN,
            x_max: f64::MAX,
            y_min: y,
            y_max: f64::MAX,
        }
    }

    /// Everything strictly below `y`.
    pub fn below(y: f64) -> BoundaryRegion {
        BoundaryRegion {
            x_min: f64::MIN,
            x_max: f64::MAX,
            y_min: f64::MIN,
            y_max: y,
        }
    }

    pub fn contains(&self, vertex: &Vertex) -> bool {
        vertex.x > self.x_min
            && vertex.x < self.x_max
            && vertex.y > self.y_min
            && vertex.y < self.y_max
    }
}
