mod export;
mod hypersensitive;
mod linear_quadratic;
